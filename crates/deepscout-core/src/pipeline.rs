use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::manager::RunOutcome;
use crate::model::{Coverage, Stage};

/// One line of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub final_stage: Stage,
    pub failed_stage: Option<Stage>,
    pub error_kind: Option<ErrorKind>,
    pub coverage: Coverage,
    pub charts: usize,
    pub report_path: Option<String>,
    pub trace_steps: usize,
}

impl RunRecord {
    pub fn from_outcome(outcome: &RunOutcome, report_path: Option<&Path>) -> Self {
        let context = outcome.context();
        let coverage = context
            .analysis()
            .map(|analysis| analysis.coverage.clone())
            .unwrap_or_else(|| Coverage::from_records(context.records()));
        Self {
            run_id: context.run_id(),
            timestamp: Utc::now(),
            query: context.query().to_string(),
            final_stage: outcome.final_stage(),
            failed_stage: outcome.failure().map(|f| f.stage),
            error_kind: outcome.failure().map(|f| f.kind),
            coverage,
            charts: outcome
                .report()
                .map(|r| r.visualization_refs.len())
                .unwrap_or_default(),
            report_path: report_path.map(|p| p.display().to_string()),
            trace_steps: context.trace().events().len(),
        }
    }
}

fn todays_file(dir: &Path) -> PathBuf {
    dir.join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")))
}

/// Append the outcome to `<dir>/<YYYY-MM-DD>.jsonl`. Problems are logged and
/// swallowed; the run log never affects the run itself.
pub fn persist_run_record(
    dir: &Path,
    outcome: &RunOutcome,
    report_path: Option<&Path>,
) -> Option<PathBuf> {
    if let Err(err) = create_dir_all(dir) {
        warn!(error = %err, path = %dir.display(), "unable to create run record directory");
        return None;
    }

    let record = RunRecord::from_outcome(outcome, report_path);
    let file_path = todays_file(dir);
    let mut file = match OpenOptions::new().create(true).append(true).open(&file_path) {
        Ok(file) => file,
        Err(err) => {
            warn!(error = %err, path = %file_path.display(), "unable to open run log");
            return None;
        }
    };

    if let Err(err) = serde_json::to_writer(&mut file, &record) {
        warn!(error = %err, "failed to serialise run record");
        return None;
    }
    if let Err(err) = writeln!(file) {
        warn!(error = %err, "failed to append newline to run log");
        return None;
    }
    Some(file_path)
}
