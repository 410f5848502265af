use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

use crate::model::{FetchStatus, Stage};

struct PipelineMetrics {
    runs: Counter<u64>,
    sources: Counter<u64>,
    retrieval_ms: Histogram<f64>,
    images: Counter<u64>,
}

static METRICS: OnceCell<PipelineMetrics> = OnceCell::new();

fn handles() -> &'static PipelineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepscout.pipeline");
        PipelineMetrics {
            runs: meter
                .u64_counter("deepscout_runs_total")
                .with_description("Completed pipeline runs by final stage")
                .init(),
            sources: meter
                .u64_counter("deepscout_sources_total")
                .with_description("Retrieved sources by fetch status")
                .init(),
            retrieval_ms: meter
                .f64_histogram("deepscout_retrieval_duration_ms")
                .with_description("Per-source retrieval time in milliseconds")
                .init(),
            images: meter
                .u64_counter("deepscout_images_total")
                .with_description("Image descriptions by outcome")
                .init(),
        }
    })
}

/// Record one settled retrieval (no-op if no meter provider is installed).
pub fn record_source(status: FetchStatus, duration_ms: u64, described: usize, failed: usize) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.as_str())];
    metrics.sources.add(1, &attrs);
    metrics.retrieval_ms.record(duration_ms as f64, &attrs);
    metrics
        .images
        .add(described as u64, &[KeyValue::new("outcome", "described")]);
    metrics
        .images
        .add(failed as u64, &[KeyValue::new("outcome", "failed")]);
}

/// Record the end of a run.
pub fn record_run(final_stage: Stage, usable_sources: usize) {
    let attrs = [
        KeyValue::new("stage", final_stage.as_str()),
        KeyValue::new("usable_sources", usable_sources as i64),
    ];
    handles().runs.add(1, &attrs);
}
