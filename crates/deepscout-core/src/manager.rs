//! Run orchestration.
//!
//! The [`Manager`] is the only component that sequences stages. It walks
//! `Idle → Searching → Retrieving → Analyzing → Reporting → Done`, drops into
//! `Failed` on an unrecoverable error, and keeps all run state in a
//! [`RunContext`] it owns for the duration of one call to [`Manager::run`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{
    AnalystAgent, ChartRenderer, PageFetcher, ReporterAgent, RetrievalAgent, SearchAgent,
    SearchProvider, VisionModel,
};
use crate::config::Config;
use crate::error::{ErrorKind, PipelineError};
use crate::events::{Event, EventCollector, drain_events};
use crate::metrics;
use crate::model::{
    AnalysisResult, FailureReport, FetchStatus, Report, SearchResult, SourceRecord, Stage,
};
use crate::retry::RetryPolicy;
use crate::trace::TraceCollector;

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 5;
const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Run-scoped state. Created by [`Manager::run`] and handed back, frozen,
/// inside the [`RunOutcome`].
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    query: String,
    started_at: DateTime<Utc>,
    stage: Stage,
    stage_started: Instant,
    history: Vec<Stage>,
    search_results: Vec<SearchResult>,
    records: Vec<SourceRecord>,
    analysis: Option<AnalysisResult>,
    trace: TraceCollector,
    events: EventCollector,
    receiver: Option<mpsc::UnboundedReceiver<Event>>,
}

impl RunContext {
    fn new(query: &str, observer: Option<&EventCollector>) -> Self {
        let (local, receiver) = EventCollector::new();
        let events = match observer {
            Some(observer) => local.merged(observer),
            None => local,
        };
        Self {
            run_id: Uuid::new_v4(),
            query: query.to_string(),
            started_at: Utc::now(),
            stage: Stage::Idle,
            stage_started: Instant::now(),
            history: vec![Stage::Idle],
            search_results: Vec::new(),
            records: Vec::new(),
            analysis: None,
            trace: TraceCollector::new(),
            events,
            receiver: Some(receiver),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage the run entered, in order.
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn search_results(&self) -> &[SearchResult] {
        &self.search_results
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.analysis.as_ref()
    }

    pub fn trace(&self) -> &TraceCollector {
        &self.trace
    }

    fn usable_sources(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.fetch_status().is_usable())
            .count()
    }

    /// Move to the stage's only successor.
    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            self.enter(next);
        }
    }

    fn mark_failed(&mut self) {
        if !self.stage.is_terminal() {
            self.enter(Stage::Failed);
        }
    }

    fn enter(&mut self, next: Stage) {
        let elapsed = self.stage_started.elapsed().as_millis() as u64;
        if self.stage != Stage::Idle {
            self.events.emit_stage_exited(self.run_id, self.stage, elapsed);
        }
        info!(
            run_id = %self.run_id,
            from = %self.stage,
            to = %next,
            elapsed_ms = elapsed,
            "stage transition"
        );
        self.stage = next;
        self.stage_started = Instant::now();
        self.history.push(next);
        self.events.emit_stage_entered(self.run_id, next);
    }

    /// Collect buffered events into the trace. Called once the run is terminal.
    fn finish(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            let events = drain_events(&mut receiver);
            self.trace = TraceCollector::from_events(&events);
        }
    }
}

/// Terminal result of [`Manager::run`].
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        report: Report,
        context: RunContext,
    },
    Failed {
        failure: FailureReport,
        /// Best-effort report, absent when the run died before retrieval.
        degraded_report: Option<Report>,
        context: RunContext,
    },
}

impl RunOutcome {
    /// The full report, or the degraded one for a failed run.
    pub fn report(&self) -> Option<&Report> {
        match self {
            RunOutcome::Completed { report, .. } => Some(report),
            RunOutcome::Failed {
                degraded_report, ..
            } => degraded_report.as_ref(),
        }
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            RunOutcome::Completed { .. } => None,
            RunOutcome::Failed { failure, .. } => Some(failure),
        }
    }

    pub fn context(&self) -> &RunContext {
        match self {
            RunOutcome::Completed { context, .. } | RunOutcome::Failed { context, .. } => context,
        }
    }

    pub fn final_stage(&self) -> Stage {
        self.context().stage()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

/// Run CPU-bound stage work on the blocking pool. A panic becomes an
/// internal stage failure instead of unwinding into the run.
async fn run_blocking<T, F>(label: &str, work: F) -> Result<T, StageFailure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StageFailure {
            kind: ErrorKind::Internal,
            reason: format!("{label} task failed: {err}"),
            attempts: 1,
        })
}

struct StageFailure {
    kind: ErrorKind,
    reason: String,
    attempts: usize,
}

/// Drives the four agents through one run per call.
pub struct Manager {
    search: SearchAgent,
    retrieval: Arc<RetrievalAgent>,
    analyst: Arc<AnalystAgent>,
    reporter: Arc<ReporterAgent>,
    retry: RetryPolicy,
    max_concurrent_fetches: usize,
    retrieval_timeout: Duration,
    observer: Option<EventCollector>,
}

impl Manager {
    pub fn new(
        search: SearchAgent,
        retrieval: RetrievalAgent,
        analyst: AnalystAgent,
        reporter: ReporterAgent,
    ) -> Self {
        Self {
            search,
            retrieval: Arc::new(retrieval),
            analyst: Arc::new(analyst),
            reporter: Arc::new(reporter),
            retry: RetryPolicy::default(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            retrieval_timeout: DEFAULT_RETRIEVAL_TIMEOUT,
            observer: None,
        }
    }

    /// Wire agents around the given collaborators using `config`.
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        vision: Arc<dyn VisionModel>,
        renderer: Arc<dyn ChartRenderer>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let search = SearchAgent::new(provider, config.search.max_results)
            .with_query_variants(config.search.query_variants.clone());
        let retrieval =
            RetrievalAgent::new(fetcher, vision, &config.retrieval).with_retry(retry.clone());
        let analyst = AnalystAgent::new(config.analyst.clone());
        let reporter = ReporterAgent::new(renderer, config.reporter.max_charts);

        Self::new(search, retrieval, analyst, reporter)
            .with_retry(retry)
            .with_max_concurrent_fetches(config.retrieval.max_concurrent_fetches)
            .with_retrieval_timeout(config.retrieval.run_timeout())
    }

    /// Retry policy for the search stage.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit.max(1);
        self
    }

    /// Wall-clock bound on the whole retrieval fan-out.
    pub fn with_retrieval_timeout(mut self, timeout: Duration) -> Self {
        self.retrieval_timeout = timeout;
        self
    }

    /// Also deliver every run event to `observer`.
    pub fn with_observer(mut self, observer: EventCollector) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run(&self, query: &str) -> RunOutcome {
        let mut ctx = RunContext::new(query, self.observer.as_ref());
        info!(run_id = %ctx.run_id, query, "run started");

        ctx.advance();
        let search = &self.search;
        let attempted = self.retry.run("search", move |_| search.search(query)).await;
        let results = match attempted.result {
            Ok(results) if !results.is_empty() => results,
            Ok(_) => {
                let failure = StageFailure {
                    kind: ErrorKind::NoSearchResults,
                    reason: "search returned no usable results".to_string(),
                    attempts: attempted.attempts,
                };
                return self.fail(ctx, failure, None).await;
            }
            Err(err) => {
                let failure = StageFailure {
                    kind: err.kind(),
                    reason: err.to_string(),
                    attempts: attempted.attempts,
                };
                return self.fail(ctx, failure, None).await;
            }
        };
        ctx.events.emit_message(
            ctx.run_id,
            Stage::Searching,
            format!("{} source(s) selected", results.len()),
        );
        ctx.search_results = results;

        ctx.advance();
        ctx.records = self.retrieve_all(&ctx).await;

        ctx.advance();
        let analyst = Arc::clone(&self.analyst);
        let owned_query = ctx.query.clone();
        let records = ctx.records.clone();
        let analysis = match run_blocking("analysis", move || {
            analyst.analyze(&owned_query, &records)
        })
        .await
        {
            Ok(analysis) => analysis,
            Err(failure) => {
                let fallback = AnalysisResult::insufficient(&ctx.query, &ctx.records);
                return self.fail(ctx, failure, Some(fallback)).await;
            }
        };
        if analysis.insufficient_data {
            let err = PipelineError::InsufficientData(format!(
                "0 of {} source(s) usable",
                analysis.coverage.total_sources
            ));
            warn!(run_id = %ctx.run_id, kind = %err.kind(), error = %err, "reporting gaps only");
            ctx.events.emit_message(ctx.run_id, Stage::Analyzing, err.to_string());
        }
        ctx.analysis = Some(analysis.clone());

        ctx.advance();
        let reporter = Arc::clone(&self.reporter);
        let report = match run_blocking("report", move || reporter.report(&analysis)).await {
            Ok(report) => report,
            Err(failure) => {
                let fallback = ctx.analysis.clone();
                return self.fail(ctx, failure, fallback).await;
            }
        };

        ctx.advance();
        info!(
            run_id = %ctx.run_id,
            usable = ctx.usable_sources(),
            charts = report.visualization_refs.len(),
            "run completed"
        );
        metrics::record_run(Stage::Done, ctx.usable_sources());
        ctx.finish();
        RunOutcome::Completed {
            report,
            context: ctx,
        }
    }

    /// Fan out one task per search result and join them back in rank order.
    async fn retrieve_all(&self, ctx: &RunContext) -> Vec<SourceRecord> {
        let results = &ctx.search_results;
        let run_id = ctx.run_id;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_fetches));
        let deadline = tokio::time::Instant::now() + self.retrieval_timeout;

        let mut set = JoinSet::new();
        for (index, result) in results.iter().cloned().enumerate() {
            let agent = Arc::clone(&self.retrieval);
            let semaphore = Arc::clone(&semaphore);
            let events = ctx.events.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let record = agent.retrieve(&result).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                events.emit_source_settled(
                    run_id,
                    result.rank,
                    result.url.clone(),
                    record.fetch_status(),
                    duration_ms,
                );
                metrics::record_source(
                    record.fetch_status(),
                    duration_ms,
                    record.images().len(),
                    record.failed_images(),
                );
                (index, record)
            });
        }

        let mut slots: Vec<Option<SourceRecord>> = vec![None; results.len()];
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((index, record)))) => slots[index] = Some(record),
                Ok(Some(Err(err))) => {
                    warn!(run_id = %run_id, error = %err, "retrieval task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    warn!(
                        run_id = %run_id,
                        pending = set.len(),
                        timeout_ms = self.retrieval_timeout.as_millis() as u64,
                        "retrieval deadline elapsed, aborting pending sources"
                    );
                    set.shutdown().await;
                    break;
                }
            }
        }

        let missing_reason = if timed_out {
            "retrieval timed out"
        } else {
            "retrieval task aborted"
        };
        slots
            .into_iter()
            .zip(results)
            .map(|(slot, result)| match slot {
                Some(record) => record,
                None => {
                    ctx.events.emit_source_settled(
                        run_id,
                        result.rank,
                        result.url.clone(),
                        FetchStatus::Failed,
                        0,
                    );
                    SourceRecord::failed(result, missing_reason)
                }
            })
            .collect()
    }

    async fn fail(
        &self,
        mut ctx: RunContext,
        failure: StageFailure,
        analysis: Option<AnalysisResult>,
    ) -> RunOutcome {
        let failed_stage = ctx.stage;
        ctx.mark_failed();
        let failure = FailureReport {
            run_id: ctx.run_id,
            query: ctx.query.clone(),
            stage: failed_stage,
            kind: failure.kind,
            reason: failure.reason,
            attempts: failure.attempts,
        };
        warn!(
            run_id = %failure.run_id,
            stage = %failure.stage,
            kind = %failure.kind,
            attempts = failure.attempts,
            reason = %failure.reason,
            "run failed"
        );

        let degraded_report = match analysis {
            Some(analysis) => {
                let reporter = Arc::clone(&self.reporter);
                let for_report = failure.clone();
                let report = analysis.clone();
                ctx.analysis = Some(analysis);
                tokio::task::spawn_blocking(move || reporter.report_degraded(&report, &for_report))
                    .await
                    .map_err(|err| warn!(error = %err, "degraded report could not be rendered"))
                    .ok()
            }
            None => None,
        };

        metrics::record_run(Stage::Failed, ctx.usable_sources());
        ctx.finish();
        RunOutcome::Failed {
            failure,
            degraded_report,
            context: ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ChartSpec;
    use crate::config::RetrievalConfig;
    use crate::providers::offline::{ScriptedVisionModel, StaticPageFetcher, StaticSearchProvider};

    struct NullRenderer;

    impl ChartRenderer for NullRenderer {
        fn render(&self, spec: &ChartSpec) -> Result<String, PipelineError> {
            Ok(spec.chart_id.clone())
        }
    }

    fn manager(provider: StaticSearchProvider, fetcher: StaticPageFetcher) -> Manager {
        let retrieval = RetrievalAgent::new(
            Arc::new(fetcher),
            Arc::new(ScriptedVisionModel::new()),
            &RetrievalConfig {
                min_text_chars: 0,
                ..RetrievalConfig::default()
            },
        )
        .with_retry(RetryPolicy::none());
        Manager::new(
            SearchAgent::new(Arc::new(provider), 10),
            retrieval,
            AnalystAgent::default(),
            ReporterAgent::new(Arc::new(NullRenderer), 2),
        )
        .with_retry(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        })
    }

    #[tokio::test]
    async fn successful_run_walks_every_stage() {
        let provider =
            StaticSearchProvider::new(vec![SearchResult::new("https://a.test", "A", 1)]);
        let fetcher =
            StaticPageFetcher::new().with_page("https://a.test", "Module efficiency is 22%.", &[]);
        let outcome = manager(provider, fetcher).run("solar").await;

        assert!(outcome.is_completed());
        assert_eq!(
            outcome.context().history(),
            &[
                Stage::Idle,
                Stage::Searching,
                Stage::Retrieving,
                Stage::Analyzing,
                Stage::Reporting,
                Stage::Done
            ]
        );
        assert!(!outcome.context().trace().is_empty());
    }

    #[tokio::test]
    async fn transient_search_outage_is_retried() {
        let provider = StaticSearchProvider::failing_times(
            2,
            vec![SearchResult::new("https://a.test", "A", 1)],
        );
        let fetcher = StaticPageFetcher::new().with_page("https://a.test", "text", &[]);
        let outcome = manager(provider, fetcher).run("solar").await;
        assert_eq!(outcome.final_stage(), Stage::Done);
    }

    #[tokio::test]
    async fn empty_search_fails_without_report() {
        let outcome = manager(StaticSearchProvider::new(Vec::new()), StaticPageFetcher::new())
            .run("solar")
            .await;

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.stage, Stage::Searching);
        assert_eq!(failure.kind, ErrorKind::NoSearchResults);
        assert!(outcome.report().is_none());
        assert_eq!(outcome.final_stage(), Stage::Failed);
    }

    #[tokio::test]
    async fn blank_query_fails_at_search() {
        let outcome = manager(StaticSearchProvider::new(Vec::new()), StaticPageFetcher::new())
            .run("  ")
            .await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::InvalidQuery);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn panicking_stage_work_becomes_an_internal_failure() {
        let failure = run_blocking("analysis", || -> usize { panic!("analyst blew up") })
            .await
            .err()
            .unwrap();
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert!(failure.reason.starts_with("analysis task failed"));
        assert_eq!(failure.attempts, 1);

        assert_eq!(run_blocking("report", || 7).await.ok(), Some(7));
    }

    #[tokio::test]
    async fn failure_after_analysis_keeps_a_degraded_report() {
        let hit = SearchResult::new("https://a.test", "A", 1);
        let fetcher = StaticPageFetcher::new().with_page(
            "https://a.test",
            "Module efficiency was 22% in 2023.",
            &[],
        );
        let manager = manager(StaticSearchProvider::new(vec![hit.clone()]), fetcher);

        let mut ctx = RunContext::new("solar", None);
        for _ in 0..4 {
            ctx.advance();
        }
        assert_eq!(ctx.stage(), Stage::Reporting);
        ctx.search_results = vec![hit.clone()];
        ctx.records = vec![manager.retrieval.retrieve(&hit).await];
        let analysis = manager.analyst.analyze("solar", &ctx.records);

        let failure = StageFailure {
            kind: ErrorKind::Internal,
            reason: "report task failed: task panicked".to_string(),
            attempts: 1,
        };
        let outcome = manager.fail(ctx, failure, Some(analysis)).await;

        assert_eq!(outcome.final_stage(), Stage::Failed);
        assert_eq!(outcome.failure().unwrap().stage, Stage::Reporting);
        assert_eq!(
            &outcome.context().history()[4..],
            &[Stage::Reporting, Stage::Failed]
        );
        assert!(outcome.context().analysis().is_some());
        let report = outcome.report().expect("degraded report");
        assert!(
            report
                .markdown_body
                .contains("> **Degraded run:** stage Reporting failed: report task failed")
        );
        assert!(report.markdown_body.contains("| module_efficiency | 1 | 22.00% |"));
        assert!(report.visualization_refs.is_empty());
    }

    #[tokio::test]
    async fn insufficient_analysis_is_noted_in_the_trace() {
        let provider =
            StaticSearchProvider::new(vec![SearchResult::new("https://gone.test", "Gone", 1)]);
        let outcome = manager(provider, StaticPageFetcher::new()).run("solar").await;

        assert_eq!(outcome.final_stage(), Stage::Done);
        assert!(
            outcome
                .context()
                .trace()
                .events()
                .iter()
                .any(|event| {
                    event.message == "Analyzing: insufficient data: 0 of 1 source(s) usable"
                })
        );
    }

    #[tokio::test]
    async fn observer_sees_the_same_events_as_the_trace() {
        let (observer, mut receiver) = EventCollector::new();
        let provider =
            StaticSearchProvider::new(vec![SearchResult::new("https://a.test", "A", 1)]);
        let fetcher = StaticPageFetcher::new().with_page("https://a.test", "text", &[]);
        let outcome = manager(provider, fetcher)
            .with_observer(observer)
            .run("solar")
            .await;

        let observed = drain_events(&mut receiver);
        assert_eq!(observed.len(), outcome.context().trace().events().len());
        assert!(observed.iter().all(|e| e.run_id() == outcome.context().run_id()));
    }
}
