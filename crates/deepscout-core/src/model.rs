//! Data contracts passed between pipeline stages.
//!
//! Each stage consumes the previous stage's output type and nothing else:
//! `SearchResult` → `SourceRecord` → `AnalysisResult` → `Report`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Searching,
    Retrieving,
    Analyzing,
    Reporting,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "Idle",
            Stage::Searching => "Searching",
            Stage::Retrieving => "Retrieving",
            Stage::Analyzing => "Analyzing",
            Stage::Reporting => "Reporting",
            Stage::Done => "Done",
            Stage::Failed => "Failed",
        }
    }

    /// The only non-failure successor of this stage.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Searching),
            Stage::Searching => Some(Stage::Retrieving),
            Stage::Retrieving => Some(Stage::Analyzing),
            Stage::Analyzing => Some(Stage::Reporting),
            Stage::Reporting => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked hit from the search stage. Rank 1 is the best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub rank: u32,
    pub snippet: String,
}

impl SearchResult {
    pub fn new(url: impl Into<String>, title: impl Into<String>, rank: u32) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            rank,
            snippet: String::new(),
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Partial,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::Partial => "partial",
            FetchStatus::Failed => "failed",
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self, FetchStatus::Failed)
    }
}

/// A vision-language model description of one image on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInsight {
    pub image_ref: String,
    pub vlm_description: String,
    pub confidence: Option<f32>,
}

impl ImageInsight {
    pub fn new(image_ref: impl Into<String>, vlm_description: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            vlm_description: vlm_description.into(),
            confidence: None,
        }
    }
}

/// Retrieval output for one URL. Built once through [`SourceRecordBuilder`]
/// or [`SourceRecord::failed`] and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    url: String,
    title: String,
    rank: u32,
    fetched_at: DateTime<Utc>,
    text_content: String,
    images: Vec<ImageInsight>,
    failed_images: usize,
    fetch_status: FetchStatus,
    failure_reason: Option<String>,
}

impl SourceRecord {
    pub fn builder(result: &SearchResult) -> SourceRecordBuilder {
        SourceRecordBuilder::new(result)
    }

    /// A record for a source that produced nothing usable.
    pub fn failed(result: &SearchResult, reason: impl Into<String>) -> Self {
        Self {
            url: result.url.clone(),
            title: result.title.clone(),
            rank: result.rank,
            fetched_at: Utc::now(),
            text_content: String::new(),
            images: Vec::new(),
            failed_images: 0,
            fetch_status: FetchStatus::Failed,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn text_content(&self) -> &str {
        &self.text_content
    }

    pub fn images(&self) -> &[ImageInsight] {
        &self.images
    }

    pub fn failed_images(&self) -> usize {
        self.failed_images
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.fetch_status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }
}

/// Append-only construction of a successfully fetched [`SourceRecord`].
#[derive(Debug)]
pub struct SourceRecordBuilder {
    url: String,
    title: String,
    rank: u32,
    fetched_at: DateTime<Utc>,
    text_content: String,
    images: Vec<ImageInsight>,
    failed_images: usize,
    notes: Vec<String>,
}

impl SourceRecordBuilder {
    fn new(result: &SearchResult) -> Self {
        Self {
            url: result.url.clone(),
            title: result.title.clone(),
            rank: result.rank,
            fetched_at: Utc::now(),
            text_content: String::new(),
            images: Vec::new(),
            failed_images: 0,
            notes: Vec::new(),
        }
    }

    pub fn fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = at;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text_content = text.into();
        self
    }

    pub fn push_image(&mut self, insight: ImageInsight) {
        self.images.push(insight);
    }

    pub fn image(mut self, insight: ImageInsight) -> Self {
        self.push_image(insight);
        self
    }

    pub fn record_image_failure(&mut self, reason: impl Into<String>) {
        self.failed_images += 1;
        self.notes.push(reason.into());
    }

    /// Freeze the record. Any image failure, or text shorter than
    /// `min_text_chars`, downgrades the status to `Partial`.
    pub fn build(self, min_text_chars: usize) -> SourceRecord {
        let mut notes = self.notes;
        let text_chars = self.text_content.chars().count();
        if text_chars < min_text_chars {
            notes.push(format!(
                "extracted text too short ({text_chars} < {min_text_chars} chars)"
            ));
        }

        let fetch_status = if notes.is_empty() {
            FetchStatus::Ok
        } else {
            FetchStatus::Partial
        };

        SourceRecord {
            url: self.url,
            title: self.title,
            rank: self.rank,
            fetched_at: self.fetched_at,
            text_content: self.text_content,
            images: self.images,
            failed_images: self.failed_images,
            fetch_status,
            failure_reason: (!notes.is_empty()).then(|| notes.join("; ")),
        }
    }
}

/// A topic value after cross-source merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFact {
    pub value: String,
    /// Number of distinct records backing `value`.
    pub support: usize,
    /// Conflicting values that lost the tie-break, best first.
    pub alternatives: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMethod {
    /// Least-squares line over dated observations.
    Linear,
    /// No usable time axis; the mean is carried forward.
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendProjection {
    pub metric: String,
    pub projected_value: f64,
    pub horizon: u32,
    pub method: ProjectionMethod,
    /// Latest observed year the horizon counts from, for linear projections.
    pub base_year: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub total_sources: usize,
    pub usable_sources: usize,
    pub ok_sources: usize,
    pub partial_sources: usize,
    pub failed_sources: usize,
    pub images_described: usize,
    pub images_failed: usize,
}

impl Coverage {
    pub fn from_records(records: &[SourceRecord]) -> Self {
        let mut coverage = Coverage {
            total_sources: records.len(),
            ..Default::default()
        };
        for record in records {
            match record.fetch_status() {
                FetchStatus::Ok => coverage.ok_sources += 1,
                FetchStatus::Partial => coverage.partial_sources += 1,
                FetchStatus::Failed => coverage.failed_sources += 1,
            }
            coverage.images_described += record.images().len();
            coverage.images_failed += record.failed_images();
        }
        coverage.usable_sources = coverage.ok_sources + coverage.partial_sources;
        coverage
    }
}

/// Per-source view carried into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub rank: u32,
    pub url: String,
    pub title: String,
    pub status: FetchStatus,
    pub note: Option<String>,
    pub images: Vec<ImageInsight>,
}

impl From<&SourceRecord> for SourceSummary {
    fn from(record: &SourceRecord) -> Self {
        Self {
            rank: record.rank(),
            url: record.url().to_string(),
            title: record.title().to_string(),
            status: record.fetch_status(),
            note: record.failure_reason().map(str::to_string),
            images: record.images().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub query: String,
    pub merged_facts: BTreeMap<String, MergedFact>,
    pub statistics: BTreeMap<String, MetricSummary>,
    pub trend_projections: Vec<TrendProjection>,
    pub coverage: Coverage,
    pub insufficient_data: bool,
    pub sources: Vec<SourceSummary>,
}

impl AnalysisResult {
    /// An analysis that carries only coverage information.
    pub fn insufficient(query: impl Into<String>, records: &[SourceRecord]) -> Self {
        Self {
            query: query.into(),
            merged_facts: BTreeMap::new(),
            statistics: BTreeMap::new(),
            trend_projections: Vec::new(),
            coverage: Coverage::from_records(records),
            insufficient_data: true,
            sources: records.iter().map(SourceSummary::from).collect(),
        }
    }
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub markdown_body: String,
    /// Chart identifiers referenced from `markdown_body`, in order.
    pub visualization_refs: Vec<String>,
}

/// Structured explanation of a run that could not finish normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: Uuid,
    pub query: String,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub reason: String,
    pub attempts: usize,
}

impl FailureReport {
    pub fn render_markdown(&self) -> String {
        let mut output = String::from("# Research run failed\n\n");
        let _ = writeln!(output, "- **Run:** {}", self.run_id);
        let _ = writeln!(output, "- **Query:** {}", self.query);
        let _ = writeln!(output, "- **Failing stage:** {}", self.stage);
        let _ = writeln!(output, "- **Error:** {}", self.kind);
        let _ = writeln!(output, "- **Attempts:** {}", self.attempts);
        let _ = writeln!(output, "\n{}", self.reason);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit() -> SearchResult {
        SearchResult::new("https://example.com/a", "A", 1)
    }

    #[test]
    fn stage_successors_are_strictly_sequential() {
        let mut stage = Stage::Idle;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                Stage::Idle,
                Stage::Searching,
                Stage::Retrieving,
                Stage::Analyzing,
                Stage::Reporting,
                Stage::Done
            ]
        );
        assert!(Stage::Failed.next().is_none());
    }

    #[test]
    fn builder_marks_image_failures_partial() {
        let mut builder = SourceRecord::builder(&hit()).text("x".repeat(50));
        builder.push_image(ImageInsight::new("a.png", "a chart"));
        builder.record_image_failure("b.png: timeout");
        let record = builder.build(10);

        assert_eq!(record.fetch_status(), FetchStatus::Partial);
        assert_eq!(record.images().len(), 1);
        assert_eq!(record.failed_images(), 1);
        assert_eq!(record.failure_reason(), Some("b.png: timeout"));
    }

    #[test]
    fn builder_marks_thin_pages_partial() {
        let record = SourceRecord::builder(&hit()).text("short").build(100);
        assert_eq!(record.fetch_status(), FetchStatus::Partial);

        let record = SourceRecord::builder(&hit()).text("long enough").build(5);
        assert_eq!(record.fetch_status(), FetchStatus::Ok);
        assert!(record.failure_reason().is_none());
    }

    #[test]
    fn failed_records_are_empty_but_keep_identity() {
        let record = SourceRecord::failed(&hit(), "connection reset");
        assert_eq!(record.fetch_status(), FetchStatus::Failed);
        assert!(record.text_content().is_empty());
        assert!(record.images().is_empty());
        assert_eq!(record.rank(), 1);
        assert_eq!(record.url(), "https://example.com/a");
    }

    #[test]
    fn coverage_counts_usable_sources() {
        let records = vec![
            SourceRecord::builder(&hit())
                .text("body")
                .image(ImageInsight::new("a.png", "x"))
                .build(0),
            SourceRecord::builder(&SearchResult::new("https://b.test", "B", 2))
                .text("")
                .build(1),
            SourceRecord::failed(&SearchResult::new("https://c.test", "C", 3), "404"),
        ];
        let coverage = Coverage::from_records(&records);
        assert_eq!(coverage.total_sources, 3);
        assert_eq!(coverage.usable_sources, 2);
        assert_eq!(coverage.ok_sources, 1);
        assert_eq!(coverage.partial_sources, 1);
        assert_eq!(coverage.failed_sources, 1);
        assert_eq!(coverage.images_described, 1);
    }

    #[test]
    fn failure_report_names_the_stage() {
        let failure = FailureReport {
            run_id: Uuid::nil(),
            query: "q".into(),
            stage: Stage::Searching,
            kind: ErrorKind::SearchUnavailable,
            reason: "provider down".into(),
            attempts: 3,
        };
        let markdown = failure.render_markdown();
        assert!(markdown.contains("Searching"));
        assert!(markdown.contains("search_unavailable"));
    }
}
