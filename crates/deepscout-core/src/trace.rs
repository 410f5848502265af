use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::Event;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub scope: String,
    pub message: String,
    pub timestamp_ms: u64,
}

impl From<&Event> for TraceEvent {
    fn from(event: &Event) -> Self {
        let scope = match event {
            Event::StageEntered { stage, .. }
            | Event::StageExited { stage, .. }
            | Event::Message { stage, .. } => stage.as_str().to_string(),
            Event::SourceSettled { .. } => "Retrieving".to_string(),
        };
        Self {
            scope,
            message: event.label(),
            timestamp_ms: event.timestamp(),
        }
    }
}

/// Ordered trace of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn from_events(events: &[Event]) -> Self {
        Self {
            events: events.iter().map(TraceEvent::from).collect(),
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub scope: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                scope: event.scope.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Run trace\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. {} → {}", step.index, step.scope, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured".to_string();
        }

        let mut output = String::from("flowchart TD\n  %% auto-generated trace\n");
        for step in &self.steps {
            let node_id = format!("step{}", step.index);
            let label = sanitize_mermaid(&format!("{}: {}", step.scope, step.message));
            let _ = writeln!(output, "  {node_id}[\"{label}\"]");
        }

        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }

        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the trace of run `run_id` as pretty JSON to `<dir>/<run_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    run_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{run_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

/// Write the human-readable trace (steps plus a mermaid flowchart) of run
/// `run_id` to `<dir>/<run_id>.md`.
pub fn persist_trace_summary<P: AsRef<Path>>(
    dir: P,
    run_id: &str,
    summary: &TraceSummary,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{run_id}.md"));
    let document = format!(
        "{}\n\n```mermaid\n{}\n```\n",
        summary.render_markdown().trim_end(),
        summary.render_mermaid().trim_end()
    );
    std::fs::write(&path, document)
        .with_context(|| format!("failed to write trace summary {}", path.display()))?;
    Ok(path)
}
