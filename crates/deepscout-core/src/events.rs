//! Event bus for run explainability.
//!
//! The Manager reports stage transitions and per-source settlement here so a
//! run can be traced after the fact without reading logs.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{FetchStatus, Stage};

/// Unique identifier for an event
pub type EventId = String;

/// Manager and agent lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StageEntered {
        event_id: EventId,
        timestamp: u64,
        run_id: Uuid,
        stage: Stage,
    },
    StageExited {
        event_id: EventId,
        timestamp: u64,
        run_id: Uuid,
        stage: Stage,
        duration_ms: u64,
    },
    /// One fanned-out retrieval has settled.
    SourceSettled {
        event_id: EventId,
        timestamp: u64,
        run_id: Uuid,
        rank: u32,
        url: String,
        status: FetchStatus,
        duration_ms: u64,
    },
    Message {
        event_id: EventId,
        timestamp: u64,
        run_id: Uuid,
        stage: Stage,
        content: String,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::StageEntered { event_id, .. }
            | Event::StageExited { event_id, .. }
            | Event::SourceSettled { event_id, .. }
            | Event::Message { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Event::StageEntered { timestamp, .. }
            | Event::StageExited { timestamp, .. }
            | Event::SourceSettled { timestamp, .. }
            | Event::Message { timestamp, .. } => *timestamp,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Event::StageEntered { run_id, .. }
            | Event::StageExited { run_id, .. }
            | Event::SourceSettled { run_id, .. }
            | Event::Message { run_id, .. } => *run_id,
        }
    }

    /// Short label used for trace rendering.
    pub fn label(&self) -> String {
        match self {
            Event::StageEntered { stage, .. } => format!("enter {stage}"),
            Event::StageExited {
                stage, duration_ms, ..
            } => format!("exit {stage} after {duration_ms} ms"),
            Event::SourceSettled {
                rank, url, status, ..
            } => format!("source #{rank} {url} settled as {}", status.as_str()),
            Event::Message { stage, content, .. } => format!("{stage}: {content}"),
        }
    }
}

/// Cloneable sender half handed to the Manager and its fan-out tasks.
#[derive(Debug, Clone)]
pub struct EventCollector {
    senders: Vec<mpsc::UnboundedSender<Event>>,
}

impl EventCollector {
    /// Create a new event collector
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                senders: vec![sender],
            },
            receiver,
        )
    }

    /// A collector that delivers every event to both `self` and `other`.
    pub fn merged(&self, other: &EventCollector) -> EventCollector {
        let mut senders = self.senders.clone();
        senders.extend(other.senders.iter().cloned());
        EventCollector { senders }
    }

    pub fn emit_stage_entered(&self, run_id: Uuid, stage: Stage) {
        self.send(Event::StageEntered {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id,
            stage,
        });
    }

    pub fn emit_stage_exited(&self, run_id: Uuid, stage: Stage, duration_ms: u64) {
        self.send(Event::StageExited {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id,
            stage,
            duration_ms,
        });
    }

    pub fn emit_source_settled(
        &self,
        run_id: Uuid,
        rank: u32,
        url: String,
        status: FetchStatus,
        duration_ms: u64,
    ) {
        self.send(Event::SourceSettled {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id,
            rank,
            url,
            status,
            duration_ms,
        });
    }

    pub fn emit_message(&self, run_id: Uuid, stage: Stage, content: impl Into<String>) {
        self.send(Event::Message {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id,
            stage,
            content: content.into(),
        });
    }

    fn send(&self, event: Event) {
        for sender in &self.senders {
            // The receiver may be gone when nobody is tracing the run.
            if let Err(e) = sender.send(event.clone()) {
                tracing::trace!(error = %e, "event receiver dropped");
            }
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

/// Drain everything currently buffered in `receiver` without waiting.
pub fn drain_events(receiver: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{}", id)
}

/// Current Unix timestamp in milliseconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_events_arrive_in_order() {
        let (collector, mut receiver) = EventCollector::new();
        let run_id = Uuid::new_v4();

        collector.emit_stage_entered(run_id, Stage::Searching);
        collector.emit_stage_exited(run_id, Stage::Searching, 12);

        match receiver.recv().await.unwrap() {
            Event::StageEntered { stage, .. } => assert_eq!(stage, Stage::Searching),
            other => panic!("expected StageEntered, got {other:?}"),
        }
        let exit = receiver.recv().await.unwrap();
        assert_eq!(exit.run_id(), run_id);
        assert!(exit.label().contains("12 ms"));
    }

    #[test]
    fn drain_collects_buffered_events() {
        let (collector, mut receiver) = EventCollector::new();
        let run_id = Uuid::new_v4();
        collector.emit_source_settled(run_id, 2, "https://b.test".into(), FetchStatus::Partial, 5);
        collector.emit_message(run_id, Stage::Retrieving, "fan-out settled");

        let events = drain_events(&mut receiver);
        assert_eq!(events.len(), 2);
        assert!(events[0].label().contains("partial"));
        assert_ne!(events[0].event_id(), events[1].event_id());
    }

    #[test]
    fn merged_collectors_deliver_to_both_receivers() {
        let (first, mut first_rx) = EventCollector::new();
        let (second, mut second_rx) = EventCollector::new();
        let both = first.merged(&second);

        both.emit_stage_entered(Uuid::nil(), Stage::Analyzing);

        assert_eq!(drain_events(&mut first_rx).len(), 1);
        assert_eq!(drain_events(&mut second_rx).len(), 1);
    }

    #[test]
    fn sending_without_receiver_is_harmless() {
        let collector = EventCollector::default();
        collector.emit_message(Uuid::nil(), Stage::Idle, "nobody listening");
    }
}
