use std::fmt::Write as _;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::error::PipelineError;
use crate::model::{AnalysisResult, FailureReport, FetchStatus, MetricSummary, Report};

/// Series handed to a [`ChartRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub chart_id: String,
    pub title: String,
    pub metric: String,
    /// Labelled bars in display order.
    pub bars: Vec<(String, f64)>,
    pub unit: Option<String>,
}

/// Chart-drawing boundary. Returns the identifier the report should link to.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, spec: &ChartSpec) -> Result<String, PipelineError>;
}

/// Turns an [`AnalysisResult`] into a markdown report. Never fails: chart
/// errors become notes in the report body.
pub struct ReporterAgent {
    renderer: Arc<dyn ChartRenderer>,
    max_charts: usize,
}

impl ReporterAgent {
    pub fn new(renderer: Arc<dyn ChartRenderer>, max_charts: usize) -> Self {
        Self {
            renderer,
            max_charts,
        }
    }

    #[instrument(name = "agent.report", skip_all, fields(query = %analysis.query))]
    pub fn report(&self, analysis: &AnalysisResult) -> Report {
        let mut body = header(analysis);
        let mut refs = Vec::new();
        render_analysis(&mut body, analysis);

        if !analysis.statistics.is_empty() {
            body.push_str("\n## Charts\n\n");
            for spec in chart_specs(analysis).into_iter().take(self.max_charts) {
                match self.render_chart(&spec) {
                    Ok(chart_ref) => {
                        let _ = writeln!(body, "![{}]({})\n", spec.metric, chart_ref);
                        refs.push(chart_ref);
                    }
                    Err(err) => {
                        warn!(chart = %spec.chart_id, error = %err, "chart skipped");
                        let _ = writeln!(
                            body,
                            "_Chart for `{}` unavailable: {err}_\n",
                            spec.metric
                        );
                    }
                }
            }
        }

        render_sources(&mut body, analysis);
        info!(charts = refs.len(), "report rendered");
        Report {
            title: title(&analysis.query),
            markdown_body: body,
            visualization_refs: refs,
        }
    }

    /// A panicking renderer costs only its own chart.
    fn render_chart(&self, spec: &ChartSpec) -> Result<String, PipelineError> {
        catch_unwind(AssertUnwindSafe(|| self.renderer.render(spec))).unwrap_or_else(|_| {
            Err(PipelineError::render_failed(
                &spec.chart_id,
                "renderer panicked",
            ))
        })
    }

    /// Best-effort report for a run that failed after search. No charts are
    /// drawn.
    pub fn report_degraded(&self, analysis: &AnalysisResult, failure: &FailureReport) -> Report {
        let mut body = header(analysis);
        let _ = writeln!(
            body,
            "> **Degraded run:** stage {} failed: {} (run `{}`, {} attempt(s))\n",
            failure.stage, failure.reason, failure.run_id, failure.attempts
        );
        render_analysis(&mut body, analysis);
        render_sources(&mut body, analysis);
        Report {
            title: title(&analysis.query),
            markdown_body: body,
            visualization_refs: Vec::new(),
        }
    }
}

fn title(query: &str) -> String {
    format!("Research report: {query}")
}

fn header(analysis: &AnalysisResult) -> String {
    format!("# {}\n\n", title(&analysis.query))
}

fn render_analysis(body: &mut String, analysis: &AnalysisResult) {
    let coverage = &analysis.coverage;
    body.push_str("## Coverage\n\n");
    let _ = writeln!(
        body,
        "- Sources attempted: {}\n\
         - Usable sources: {} ({} complete, {} partial)\n\
         - Failed sources: {}\n\
         - Images described: {} ({} failed)",
        coverage.total_sources,
        coverage.usable_sources,
        coverage.ok_sources,
        coverage.partial_sources,
        coverage.failed_sources,
        coverage.images_described,
        coverage.images_failed,
    );

    let gaps: Vec<_> = analysis
        .sources
        .iter()
        .filter(|s| s.status != FetchStatus::Ok)
        .collect();
    if !gaps.is_empty() {
        body.push_str("\n### Gaps\n\n");
        for source in gaps {
            let _ = writeln!(
                body,
                "- #{} {} ({}): {}",
                source.rank,
                source.url,
                source.status.as_str(),
                source.note.as_deref().unwrap_or("no details")
            );
        }
    }

    if analysis.insufficient_data {
        body.push_str("\n## Insufficient data\n\n");
        body.push_str(
            "None of the attempted sources yielded usable content, so no facts, \
             statistics or projections could be derived.\n",
        );
        if analysis.sources.is_empty() {
            body.push_str("No sources were attempted.\n");
        }
        return;
    }

    if !analysis.statistics.is_empty() {
        body.push_str("\n## Key statistics\n\n");
        body.push_str("| Metric | n | Mean | Min | Max | Std dev |\n");
        body.push_str("|---|---|---|---|---|---|\n");
        for (metric, summary) in &analysis.statistics {
            let unit = unit_suffix(summary);
            let _ = writeln!(
                body,
                "| {metric} | {} | {:.2}{unit} | {:.2}{unit} | {:.2}{unit} | {:.2} |",
                summary.count, summary.mean, summary.min, summary.max, summary.std_dev
            );
        }
    }

    if !analysis.trend_projections.is_empty() {
        body.push_str("\n## Trend projections\n\n");
        body.push_str("| Metric | Projected | Horizon | Method |\n");
        body.push_str("|---|---|---|---|\n");
        for projection in &analysis.trend_projections {
            let unit = analysis
                .statistics
                .get(&projection.metric)
                .map(unit_suffix)
                .unwrap_or_default();
            let horizon = match projection.base_year {
                Some(year) => {
                    let target = i32::try_from(projection.horizon)
                        .map_or(i32::MAX, |horizon| year.saturating_add(horizon));
                    format!("{target} ({year} + {})", projection.horizon)
                }
                None => format!("+{}", projection.horizon),
            };
            let _ = writeln!(
                body,
                "| {} | {:.2}{unit} | {horizon} | {:?} |",
                projection.metric, projection.projected_value, projection.method
            );
        }
    }

    if !analysis.merged_facts.is_empty() {
        body.push_str("\n## Findings\n\n");
        for (topic, fact) in &analysis.merged_facts {
            let _ = write!(
                body,
                "- **{topic}**: {} (supported by {} source(s))",
                fact.value, fact.support
            );
            if !fact.alternatives.is_empty() {
                let _ = write!(body, "; also reported: {}", fact.alternatives.join(", "));
            }
            body.push('\n');
        }
    } else {
        body.push_str("\nNo numeric facts could be extracted from the usable sources.\n");
    }

    let described: Vec<_> = analysis
        .sources
        .iter()
        .filter(|s| !s.images.is_empty())
        .collect();
    if !described.is_empty() {
        body.push_str("\n## Visual evidence\n\n");
        for source in described {
            let _ = writeln!(body, "- {} ({})", source.title, source.url);
            for image in &source.images {
                if is_web_image(&image.image_ref) {
                    let _ = writeln!(
                        body,
                        "  - ![{}]({})\n    {}",
                        alt_text(&image.vlm_description),
                        image.image_ref,
                        image.vlm_description
                    );
                } else {
                    let _ = writeln!(body, "  - `{}`: {}", image.image_ref, image.vlm_description);
                }
            }
        }
    }
}

fn is_web_image(image_ref: &str) -> bool {
    image_ref.starts_with("https://") || image_ref.starts_with("http://")
}

/// Single-line alt text without characters that would end the link label.
fn alt_text(description: &str) -> String {
    let flat: String = description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(['[', ']'], "");
    match flat.char_indices().nth(80) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn render_sources(body: &mut String, analysis: &AnalysisResult) {
    if analysis.sources.is_empty() {
        return;
    }
    body.push_str("\n## Sources\n\n");
    for source in &analysis.sources {
        let _ = writeln!(
            body,
            "{}. [{}]({}) ({})",
            source.rank,
            source.title,
            source.url,
            source.status.as_str()
        );
    }
}

fn unit_suffix(summary: &MetricSummary) -> String {
    summary.unit.clone().unwrap_or_default()
}

/// One bar chart per metric, most observed first.
fn chart_specs(analysis: &AnalysisResult) -> Vec<ChartSpec> {
    let mut metrics: Vec<(&String, &MetricSummary)> = analysis.statistics.iter().collect();
    metrics.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

    metrics
        .into_iter()
        .enumerate()
        .map(|(idx, (metric, summary))| {
            let mut bars = vec![
                ("min".to_string(), summary.min),
                ("mean".to_string(), summary.mean),
                ("max".to_string(), summary.max),
            ];
            if let Some(projection) = analysis
                .trend_projections
                .iter()
                .find(|p| &p.metric == metric)
            {
                bars.push(("projected".to_string(), projection.projected_value));
            }
            ChartSpec {
                chart_id: format!("chart-{}-{}", idx + 1, metric),
                title: metric.replace('_', " "),
                metric: metric.clone(),
                bars,
                unit: summary.unit.clone(),
            }
        })
        .collect()
}

/// File name for a report on `query`.
pub fn report_filename(query: &str) -> String {
    let slug: String = query
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect();
    if slug.is_empty() {
        "report.md".to_string()
    } else {
        format!("{slug}.md")
    }
}

/// Write `report` to `<dir>/<slug>.md`.
pub fn write_report(report: &Report, dir: &Path, query: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let path = dir.join(report_filename(query));
    fs::write(&path, &report.markdown_body)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(path)
}
