use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry in a run's ordered progress/lifecycle stream.
///
/// Events are immutable once created and delivered in creation order. The
/// serialized form is tagged JSON, suitable for whatever transport ultimately
/// carries the stream to a user; delivery is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum WorkflowEvent {
    WorkflowStart {
        workflow_id: String,
        ts_ms: u128,
    },
    WorkflowUpdate {
        line: Option<u32>,
        message: String,
        hover: Option<String>,
        ts_ms: u128,
    },
    AnswerUpdate {
        line: Option<u32>,
        message: String,
        ts_ms: u128,
    },
    WorkflowEnd {
        workflow_id: String,
        ts_ms: u128,
    },
}

impl WorkflowEvent {
    pub fn ts_ms(&self) -> u128 {
        match self {
            WorkflowEvent::WorkflowStart { ts_ms, .. }
            | WorkflowEvent::WorkflowUpdate { ts_ms, .. }
            | WorkflowEvent::AnswerUpdate { ts_ms, .. }
            | WorkflowEvent::WorkflowEnd { ts_ms, .. } => *ts_ms,
        }
    }
}

/// Create the event channel for one execution.
///
/// The [`EventSink`] side is cheap to clone and safe to append from any
/// thread; the [`WorkflowEventStream`] side is the single consumer and sees
/// events in append (FIFO) order.
pub fn event_channel(workflow_id: impl Into<String>) -> (EventSink, WorkflowEventStream) {
    let (tx, rx) = channel();
    (
        EventSink {
            workflow_id: workflow_id.into(),
            tx,
        },
        WorkflowEventStream { rx },
    )
}

/// Append side of a run's event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    workflow_id: String,
    tx: Sender<WorkflowEvent>,
}

impl EventSink {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_start(&self) {
        self.push(WorkflowEvent::WorkflowStart {
            workflow_id: self.workflow_id.clone(),
            ts_ms: now_ms(),
        });
    }

    pub fn workflow_end(&self) {
        self.push(WorkflowEvent::WorkflowEnd {
            workflow_id: self.workflow_id.clone(),
            ts_ms: now_ms(),
        });
    }

    pub fn update(&self, line: Option<u32>, message: impl Into<String>, hover: Option<String>) {
        self.push(WorkflowEvent::WorkflowUpdate {
            line,
            message: message.into(),
            hover,
            ts_ms: now_ms(),
        });
    }

    pub fn answer(&self, line: Option<u32>, message: impl Into<String>) {
        self.push(WorkflowEvent::AnswerUpdate {
            line,
            message: message.into(),
            ts_ms: now_ms(),
        });
    }

    fn push(&self, event: WorkflowEvent) {
        // A dropped consumer means nobody is watching; the run itself is
        // unaffected.
        let _ = self.tx.send(event);
    }
}

/// Consume side of a run's event stream.
pub struct WorkflowEventStream {
    rx: Receiver<WorkflowEvent>,
}

impl WorkflowEventStream {
    /// Pop the next event without blocking.
    pub fn try_next(&self) -> Option<WorkflowEvent> {
        self.rx.try_recv().ok()
    }

    /// Collect every event appended so far, in append order.
    pub fn drain(&self) -> Vec<WorkflowEvent> {
        self.rx.try_iter().collect()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
