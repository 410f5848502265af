//! DeepScout core: a staged research pipeline driven by a single Manager.
//!
//! A query moves through Search → Retrieval (with image description) →
//! Analysis → Reporting. Only the Manager sequences stages; the agents are
//! stateless and only see the previous stage's output.

pub mod agents;
mod config;
mod error;
mod events;
mod manager;
mod metrics;
mod model;
mod pipeline;
pub mod providers;
mod retry;
mod security;
mod telemetry;
mod trace;

pub use agents::{
    AnalystAgent, ChartRenderer, ChartSpec, FetchedPage, ImageDescription, PageFetcher,
    ReporterAgent, RetrievalAgent, SearchAgent, SearchProvider, VisionModel, report_filename,
    write_report,
};
pub use config::{
    AnalystConfig, Config, ConfigLoader, LoggingConfig, ReporterConfig, RetrievalConfig,
    RetryConfig, SearchConfig, TieBreak, VlmConfig,
};
pub use error::{ErrorKind, PipelineError};
pub use events::{Event, EventCollector, drain_events};
pub use manager::{Manager, RunContext, RunOutcome};
pub use model::{
    AnalysisResult, Coverage, FailureReport, FetchStatus, ImageInsight, MergedFact, MetricSummary,
    ProjectionMethod, Report, SearchResult, SourceRecord, SourceRecordBuilder, SourceSummary,
    Stage, TrendProjection,
};
pub use pipeline::{RunRecord, persist_run_record};
pub use retry::{Attempted, RetryPolicy};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{
    TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace, persist_trace_summary,
};
