use chrono::{DateTime, Utc};
use maestro_core::{EventSink, RunEvent};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Counters accumulated from a run's events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub steps: u32,
    pub step_failures: u32,
    pub retries: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub compactions: u32,
    /// Sum of leaf step durations.
    pub step_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub task: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: RunMetrics,
}

/// Completed, failed and cancelled runs kept before the oldest are dropped.
pub const DEFAULT_RETENTION: usize = 1_000;

/// Tracks status and metrics for the runs the orchestrator has seen.
///
/// Installed as an [`EventSink`] so counters follow the event stream.
/// Running and suspended runs are always kept. Once more than `retention`
/// runs have ended, the ones that ended first are forgotten.
pub struct RunMonitor {
    runs: RwLock<HashMap<Uuid, RunState>>,
    /// Ended runs in the order they ended.
    ended: Mutex<VecDeque<Uuid>>,
    retention: usize,
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            ended: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    /// Mark a run as running. Metrics carry over when a resumed run was
    /// already tracked.
    pub fn start_run(&self, run_id: Uuid, task: &str) {
        let mut runs = self.runs.write();
        let state = runs.entry(run_id).or_insert_with(|| RunState {
            run_id,
            task: task.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            metrics: RunMetrics::default(),
        });
        state.status = RunStatus::Running;
        state.finished_at = None;
    }

    /// Record a run's final (or suspended) status.
    pub fn finish_run(&self, run_id: Uuid, status: RunStatus) {
        let mut runs = self.runs.write();
        if let Some(state) = runs.get_mut(&run_id) {
            state.status = status;
            if status != RunStatus::Running {
                state.finished_at = Some(Utc::now());
            }
        }
        if !status.is_terminal() || !runs.contains_key(&run_id) {
            return;
        }

        let mut ended = self.ended.lock();
        ended.retain(|id| *id != run_id);
        ended.push_back(run_id);
        let mut evicted = 0;
        while ended.len() > self.retention {
            let Some(oldest) = ended.pop_front() else { break };
            if runs.get(&oldest).is_some_and(|s| s.status.is_terminal()) {
                runs.remove(&oldest);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, retained = self.retention, "Evicted finished runs");
        }
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    pub fn get_state(&self, run_id: Uuid) -> Option<RunState> {
        self.runs.read().get(&run_id).cloned()
    }

    /// All tracked runs, newest first.
    pub fn snapshot(&self) -> Vec<RunState> {
        let mut runs: Vec<RunState> = self.runs.read().values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    pub fn count_with(&self, status: RunStatus) -> usize {
        self.runs
            .read()
            .values()
            .filter(|s| s.status == status)
            .count()
    }

    pub fn aggregate_metrics(&self) -> RunMetrics {
        let runs = self.runs.read();
        let mut total = RunMetrics::default();
        for state in runs.values() {
            let m = &state.metrics;
            total.steps += m.steps;
            total.step_failures += m.step_failures;
            total.retries += m.retries;
            total.tool_calls += m.tool_calls;
            total.tool_errors += m.tool_errors;
            total.compactions += m.compactions;
            total.step_ms += m.step_ms;
        }
        total
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "runs": self.snapshot(),
            "aggregate": self.aggregate_metrics(),
        })
    }
}

impl EventSink for RunMonitor {
    fn emit(&self, run_id: Uuid, event: RunEvent) {
        let mut runs = self.runs.write();
        let Some(state) = runs.get_mut(&run_id) else {
            return;
        };
        let m = &mut state.metrics;
        match event {
            RunEvent::StepFinished { duration_ms, .. } => {
                m.steps += 1;
                m.step_ms += duration_ms;
            }
            RunEvent::StepFailed { .. } => m.step_failures += 1,
            RunEvent::RetryScheduled { .. } => m.retries += 1,
            RunEvent::ToolInvoked { error, .. } => {
                m.tool_calls += 1;
                if error.is_some() {
                    m.tool_errors += 1;
                }
            }
            RunEvent::Compacted { .. } => m.compactions += 1,
            _ => {}
        }
    }
}
