use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::facts::extract_facts;
use crate::config::{AnalystConfig, TieBreak};
use crate::model::{
    AnalysisResult, Coverage, MergedFact, MetricSummary, ProjectionMethod, SourceRecord,
    SourceSummary, TrendProjection,
};

/// One (topic, value) vote from one record.
#[derive(Debug, Clone)]
struct Observation {
    raw_value: String,
    value: f64,
    unit: Option<String>,
    year: Option<i32>,
    url: String,
    rank: u32,
    fetched_at: DateTime<Utc>,
}

/// Aggregates per-source records into merged facts, statistics and
/// projections. Deterministic: the same records always give the same result.
#[derive(Debug, Clone, Default)]
pub struct AnalystAgent {
    config: AnalystConfig,
}

impl AnalystAgent {
    pub fn new(config: AnalystConfig) -> Self {
        Self { config }
    }

    #[instrument(name = "agent.analyze", skip(self, records), fields(records = records.len()))]
    pub fn analyze(&self, query: &str, records: &[SourceRecord]) -> AnalysisResult {
        let coverage = Coverage::from_records(records);
        if coverage.usable_sources == 0 {
            info!(total = coverage.total_sources, "no usable sources, analysis is insufficient");
            return AnalysisResult::insufficient(query, records);
        }

        let observations = collect_observations(records);
        let merged_facts = observations
            .iter()
            .map(|(topic, obs)| (topic.clone(), merge_topic(obs, self.config.tie_break)))
            .collect();
        let statistics: BTreeMap<String, MetricSummary> = observations
            .iter()
            .map(|(topic, obs)| (topic.clone(), summarize(obs)))
            .collect();
        let trend_projections = observations
            .iter()
            .filter_map(|(topic, obs)| {
                let summary = statistics.get(topic)?;
                Some(project(topic, obs, summary, self.config.projection_horizon))
            })
            .collect();

        info!(
            topics = statistics.len(),
            usable = coverage.usable_sources,
            "analysis complete"
        );

        AnalysisResult {
            query: query.to_string(),
            merged_facts,
            statistics,
            trend_projections,
            coverage,
            insufficient_data: false,
            sources: records.iter().map(SourceSummary::from).collect(),
        }
    }
}

fn collect_observations(records: &[SourceRecord]) -> BTreeMap<String, Vec<Observation>> {
    let mut by_topic: BTreeMap<String, Vec<Observation>> = BTreeMap::new();

    for record in records.iter().filter(|r| r.fetch_status().is_usable()) {
        let mut voted = BTreeSet::new();
        let texts = std::iter::once(record.text_content())
            .chain(record.images().iter().map(|i| i.vlm_description.as_str()));

        for fact in texts.flat_map(extract_facts) {
            if !voted.insert((fact.topic.clone(), fact.raw_value.clone())) {
                continue;
            }
            by_topic.entry(fact.topic).or_default().push(Observation {
                raw_value: fact.raw_value,
                value: fact.value,
                unit: fact.unit,
                year: fact.year,
                url: record.url().to_string(),
                rank: record.rank(),
                fetched_at: record.fetched_at(),
            });
        }
    }

    debug!(topics = by_topic.len(), "collected observations");
    by_topic
}

struct Candidate<'a> {
    value: &'a str,
    backers: Vec<&'a Observation>,
}

impl Candidate<'_> {
    fn latest(&self) -> DateTime<Utc> {
        self.backers
            .iter()
            .map(|o| o.fetched_at)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn best_rank(&self) -> u32 {
        self.backers.iter().map(|o| o.rank).min().unwrap_or(u32::MAX)
    }
}

fn merge_topic(observations: &[Observation], tie_break: TieBreak) -> MergedFact {
    let mut grouped: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for obs in observations {
        grouped.entry(obs.raw_value.as_str()).or_default().push(obs);
    }
    let mut candidates: Vec<Candidate<'_>> = grouped
        .into_iter()
        .map(|(value, backers)| Candidate { value, backers })
        .collect();

    candidates.sort_by(|a, b| match tie_break {
        TieBreak::Majority => b
            .backers
            .len()
            .cmp(&a.backers.len())
            .then_with(|| b.latest().cmp(&a.latest()))
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.value.cmp(b.value)),
        TieBreak::MostRecent => b
            .latest()
            .cmp(&a.latest())
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| b.backers.len().cmp(&a.backers.len()))
            .then_with(|| a.value.cmp(b.value)),
    });

    let mut ranked = candidates.into_iter();
    let Some(winner) = ranked.next() else {
        return MergedFact {
            value: String::new(),
            support: 0,
            alternatives: Vec::new(),
            sources: Vec::new(),
        };
    };

    let mut backers = winner.backers.clone();
    backers.sort_by_key(|o| o.rank);
    MergedFact {
        value: winner.value.to_string(),
        support: winner.backers.len(),
        alternatives: ranked.map(|c| c.value.to_string()).collect(),
        sources: backers.iter().map(|o| o.url.clone()).collect(),
    }
}

fn summarize(observations: &[Observation]) -> MetricSummary {
    let count = observations.len();
    let values: Vec<f64> = observations.iter().map(|o| o.value).collect();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let first_unit = observations.first().and_then(|o| o.unit.clone());
    let unit = observations
        .iter()
        .all(|o| o.unit == first_unit)
        .then_some(first_unit)
        .flatten();

    MetricSummary {
        count,
        mean,
        min,
        max,
        std_dev: variance.sqrt(),
        unit,
    }
}

fn project(
    metric: &str,
    observations: &[Observation],
    summary: &MetricSummary,
    horizon: u32,
) -> TrendProjection {
    let dated: Vec<(f64, f64)> = observations
        .iter()
        .filter_map(|o| o.year.map(|y| (f64::from(y), o.value)))
        .collect();
    let distinct_years: BTreeSet<i64> = dated.iter().map(|(x, _)| *x as i64).collect();

    if distinct_years.len() >= 2 {
        let n = dated.len() as f64;
        let mean_x = dated.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = dated.iter().map(|(_, y)| y).sum::<f64>() / n;
        let sxy: f64 = dated.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
        let sxx: f64 = dated.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;

        let base_year = distinct_years.iter().next_back().copied().map(|y| y as i32);
        let target = base_year.map_or(mean_x, f64::from) + f64::from(horizon);
        return TrendProjection {
            metric: metric.to_string(),
            projected_value: intercept + slope * target,
            horizon,
            method: ProjectionMethod::Linear,
            base_year,
        };
    }

    TrendProjection {
        metric: metric.to_string(),
        projected_value: summary.mean,
        horizon,
        method: ProjectionMethod::Flat,
        base_year: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageInsight, SearchResult};
    use chrono::TimeZone;

    fn record(rank: u32, text: &str, day: u32) -> SourceRecord {
        let hit = SearchResult::new(format!("https://s{rank}.test"), format!("S{rank}"), rank);
        SourceRecord::builder(&hit)
            .fetched_at(Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap())
            .text(text)
            .build(0)
    }

    fn failed(rank: u32) -> SourceRecord {
        let hit = SearchResult::new(format!("https://f{rank}.test"), "F", rank);
        SourceRecord::failed(&hit, "timeout")
    }

    #[test]
    fn majority_vote_wins_and_losers_are_kept() {
        let records = vec![
            record(1, "Module efficiency is 21%.", 1),
            record(2, "Module efficiency is 22%.", 2),
            record(3, "Module efficiency is 22%.", 3),
        ];
        let result = AnalystAgent::default().analyze("q", &records);
        let fact = &result.merged_facts["module_efficiency"];

        assert_eq!(fact.value, "22%");
        assert_eq!(fact.support, 2);
        assert_eq!(fact.alternatives, vec!["21%".to_string()]);
        assert_eq!(fact.sources, vec!["https://s2.test", "https://s3.test"]);
    }

    #[test]
    fn vote_ties_fall_back_to_most_recent_fetch() {
        let records = vec![
            record(1, "Module efficiency is 21%.", 9),
            record(2, "Module efficiency is 22%.", 4),
        ];
        let result = AnalystAgent::default().analyze("q", &records);
        assert_eq!(result.merged_facts["module_efficiency"].value, "21%");
    }

    #[test]
    fn most_recent_policy_ignores_the_vote() {
        let records = vec![
            record(1, "Module efficiency is 21%.", 1),
            record(2, "Module efficiency is 21%.", 2),
            record(3, "Module efficiency is 24%.", 7),
        ];
        let agent = AnalystAgent::new(AnalystConfig {
            tie_break: TieBreak::MostRecent,
            ..AnalystConfig::default()
        });
        let fact = &agent.analyze("q", &records).merged_facts["module_efficiency"];
        assert_eq!(fact.value, "24%");
        assert_eq!(fact.alternatives, vec!["21%".to_string()]);
    }

    #[test]
    fn one_vote_per_record_and_value() {
        let hit = SearchResult::new("https://s1.test", "S1", 1);
        let rec = SourceRecord::builder(&hit)
            .text("Module efficiency is 21%. Again, module efficiency is 21%.")
            .image(ImageInsight::new("a.png", "Chart: module efficiency is 21%"))
            .build(0);
        let result = AnalystAgent::default().analyze("q", &[rec]);
        assert_eq!(result.merged_facts["module_efficiency"].support, 1);
        assert_eq!(result.statistics["module_efficiency"].count, 1);
    }

    #[test]
    fn failed_records_count_for_coverage_only() {
        let records = vec![
            record(1, "Module efficiency is 20%.", 1),
            failed(2),
            record(3, "Module efficiency is 24%.", 3),
        ];
        let result = AnalystAgent::default().analyze("q", &records);
        let stats = &result.statistics["module_efficiency"];

        assert_eq!(result.coverage.total_sources, 3);
        assert_eq!(result.coverage.usable_sources, 2);
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 22.0).abs() < 1e-9);
        assert!((stats.std_dev - 2.0).abs() < 1e-9);
        assert_eq!(stats.unit.as_deref(), Some("%"));
        assert_eq!(result.sources.len(), 3);
    }

    #[test]
    fn all_failed_is_insufficient_not_an_error() {
        let result = AnalystAgent::default().analyze("q", &[failed(1), failed(2)]);
        assert!(result.insufficient_data);
        assert!(result.statistics.is_empty());
        assert_eq!(result.coverage.failed_sources, 2);
    }

    #[test]
    fn dated_observations_project_linearly() {
        let records = vec![
            record(1, "Module efficiency was 20% in 2020.", 1),
            record(2, "Module efficiency was 22% in 2022.", 2),
        ];
        let result = AnalystAgent::default().analyze("q", &records);
        let projection = &result.trend_projections[0];

        assert_eq!(projection.method, ProjectionMethod::Linear);
        assert_eq!(projection.base_year, Some(2022));
        assert!((projection.projected_value - 23.0).abs() < 1e-9);
    }

    #[test]
    fn undated_observations_project_flat() {
        let records = vec![
            record(1, "Module efficiency is 20%.", 1),
            record(2, "Module efficiency is 24%.", 2),
        ];
        let result = AnalystAgent::default().analyze("q", &records);
        let projection = &result.trend_projections[0];
        assert_eq!(projection.method, ProjectionMethod::Flat);
        assert!((projection.projected_value - 22.0).abs() < 1e-9);
    }

    #[test]
    fn analysis_is_idempotent() {
        let records = vec![
            record(1, "Module efficiency was 20% in 2020.", 1),
            record(2, "Module efficiency was 23% in 2023. Price is 0.3", 2),
            failed(3),
        ];
        let agent = AnalystAgent::default();
        assert_eq!(agent.analyze("q", &records), agent.analyze("q", &records));
    }
}
