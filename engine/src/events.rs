//! Typed events emitted by the run entry drivers.
//!
//! Orchestration only ever talks to an [`EventSink`]; wire framing belongs to
//! whatever transport adapter drains the receiving end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::types::{PlanItem, RunMode, RunStatus};
use crate::io::event_log::EventLog;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        task_id: String,
        run_id: String,
        mode: RunMode,
    },
    /// Full snapshot of the plan items.
    Plan { run_id: String, items: Vec<PlanItem> },
    /// Progress text.
    Delta { run_id: String, text: String },
    MemoryItem { run_id: String, summary: String },
    Review { run_id: String, verdict: String },
    Done { run_id: String, status: RunStatus },
    Error {
        run_id: Option<String>,
        message: String,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::Plan { .. } => "plan",
            Self::Delta { .. } => "delta",
            Self::MemoryItem { .. } => "memory_item",
            Self::Review { .. } => "review",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Sending half handed to the drivers.
///
/// A dropped receiver (client disconnect) never fails orchestration.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
    log: Option<(Arc<EventLog>, String)>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                log: None,
            },
            rx,
        )
    }

    /// Also record every event in `log` under `session`.
    pub fn with_log(mut self, log: Arc<EventLog>, session: impl Into<String>) -> Self {
        self.log = Some((log, session.into()));
        self
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some((log, session)) = &self.log
            && let Err(err) = log.record(session, &event)
        {
            warn!(session = %session, error = %format!("{err:#}"), "event log write failed");
        }
        if let Some(tx) = &self.tx {
            // Err only means the listener went away.
            let _ = tx.send(event);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_receiver_does_not_fail_emit() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        sink.emit(RunEvent::Delta {
            run_id: "r1".to_string(),
            text: "still fine".to_string(),
        });
    }

    #[tokio::test]
    async fn events_arrive_in_emit_order_and_are_logged() {
        let log = Arc::new(EventLog::in_memory());
        let (sink, mut rx) = EventSink::channel();
        let sink = sink.with_log(Arc::clone(&log), "s1");
        sink.emit(RunEvent::Delta {
            run_id: "r1".to_string(),
            text: "one".to_string(),
        });
        sink.emit(RunEvent::Done {
            run_id: "r1".to_string(),
            status: RunStatus::Done,
        });
        drop(sink);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["delta", "done"]);
        assert_eq!(log.replay("s1", 0).expect("replay").len(), 2);
    }

    #[test]
    fn events_serialize_with_snake_case_type_tag() {
        let value = serde_json::to_value(RunEvent::MemoryItem {
            run_id: "r1".to_string(),
            summary: "s".to_string(),
        })
        .expect("serialize");
        assert_eq!(value["type"], "memory_item");
    }
}
