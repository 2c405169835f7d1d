use crate::error::ErrorKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Structured events emitted while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        task: String,
    },
    RunResumed {
        checkpoint: Uuid,
    },
    StepStarted {
        path: String,
        attempt: u32,
    },
    StepFinished {
        path: String,
        duration_ms: u64,
    },
    StepFailed {
        path: String,
        kind: ErrorKind,
        message: String,
    },
    RetryScheduled {
        path: String,
        attempt: u32,
        delay_ms: u64,
    },
    ToolInvoked {
        path: String,
        tool: String,
        call_id: String,
        error: Option<ErrorKind>,
    },
    Compacted {
        before: usize,
        after: usize,
        folded_turns: usize,
    },
    Suspended {
        path: String,
        checkpoint: Uuid,
        reason: String,
    },
    RunFinished {
        status: String,
    },
}

impl RunEvent {
    /// Short event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::RunResumed { .. } => "run_resumed",
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepFinished { .. } => "step_finished",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::RetryScheduled { .. } => "retry_scheduled",
            RunEvent::ToolInvoked { .. } => "tool_invoked",
            RunEvent::Compacted { .. } => "compacted",
            RunEvent::Suspended { .. } => "suspended",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// Fire-and-forget receiver of orchestration events.
///
/// Implementations must not block; the orchestrator calls `emit` inline.
pub trait EventSink: Send + Sync {
    /// Deliver one event for the given run.
    fn emit(&self, run_id: Uuid, event: RunEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, run_id: Uuid, event: RunEvent) {
        match &event {
            RunEvent::StepFailed {
                path,
                kind,
                message,
            } => {
                error!(run_id = %run_id, path = %path, kind = %kind, error = %message, "Step failed");
            }
            RunEvent::RetryScheduled {
                path,
                attempt,
                delay_ms,
            } => {
                warn!(run_id = %run_id, path = %path, attempt, delay_ms, "Retrying step");
            }
            RunEvent::StepStarted { path, attempt } => {
                debug!(run_id = %run_id, path = %path, attempt, "Step started");
            }
            RunEvent::StepFinished { path, duration_ms } => {
                debug!(run_id = %run_id, path = %path, duration_ms, "Step finished");
            }
            RunEvent::ToolInvoked {
                path,
                tool,
                call_id,
                error,
            } => {
                info!(run_id = %run_id, path = %path, tool = %tool, call_id = %call_id, error = ?error, "Tool invoked");
            }
            other => {
                info!(run_id = %run_id, event = other.name(), "{other:?}");
            }
        }
    }
}

/// Keeps every event in memory. Useful for tests and status polling.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Uuid, RunEvent)>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in emission order.
    pub fn events(&self) -> Vec<(Uuid, RunEvent)> {
        self.events.lock().clone()
    }

    /// Events recorded for one run.
    pub fn events_for(&self, run_id: Uuid) -> Vec<RunEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| e.name() == name)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, run_id: Uuid, event: RunEvent) {
        self.events.lock().push((run_id, event));
    }
}

/// Delivers each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Creates a fan-out over the given sinks.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Adds another sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, run_id: Uuid, event: RunEvent) {
        for sink in &self.sinks {
            sink.emit(run_id, event.clone());
        }
    }
}
