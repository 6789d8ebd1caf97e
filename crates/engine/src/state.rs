//! Run-state tracking: the single source of truth for every live run.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Accepted and waiting in the scheduler.
    Queued,
    /// Fetching the project / preparing the runtime.
    Preparing,
    /// Child process alive.
    Running,
    /// Cancel requested while running; child being killed.
    Cancelling,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl RunState {
    /// Whether this state ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    fn can_transition_to(self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (RunState::Queued, RunState::Preparing) => true,
            (RunState::Preparing, RunState::Running) => true,
            (RunState::Running, RunState::Cancelling) => true,
            (RunState::Running, RunState::Completed) => true,
            (RunState::Cancelling, RunState::Completed) => true,
            // Failure and cancellation are reachable from any live state.
            (_, RunState::Failed) | (_, RunState::Cancelled) => true,
            _ => false,
        }
    }
}

/// Tracked record for one run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Worker-local run identity.
    pub run_id: String,
    /// Master-side job identity.
    pub task_id: String,
    /// Claim token to acknowledge after reporting.
    pub receipt: Option<String>,
    /// Current lifecycle state.
    pub state: RunState,
    /// When the run was accepted.
    pub queued_at: DateTime<Utc>,
    /// Whether a cancel has been requested; checked by the execute pipeline.
    pub cancel_requested: bool,
}

/// Map of live runs behind one mutex; every mutation is a short critical
/// section. The engine is the only writer; the cancel path and the stats
/// surface read through clones.
#[derive(Default)]
pub struct StateManager {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl StateManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted run in `Queued`. Returns `false` when the
    /// run id is already live.
    pub fn add(&self, run_id: &str, task_id: &str, receipt: Option<&str>) -> bool {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(run_id) {
            return false;
        }
        runs.insert(
            run_id.to_string(),
            RunRecord {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
                receipt: receipt.map(str::to_string),
                state: RunState::Queued,
                queued_at: Utc::now(),
                cancel_requested: false,
            },
        );
        true
    }

    /// Move a run to `next`. Returns `false` for unknown runs and illegal
    /// transitions (including any transition out of a terminal state).
    pub fn transition(&self, run_id: &str, next: RunState) -> bool {
        let mut runs = self.runs.lock().unwrap();
        let Some(record) = runs.get_mut(run_id) else {
            return false;
        };
        if record.state == next {
            return true;
        }
        if !record.state.can_transition_to(next) {
            tracing::warn!(
                run_id,
                from = ?record.state,
                to = ?next,
                "rejected run-state transition"
            );
            return false;
        }
        record.state = next;
        true
    }

    /// Snapshot of one run.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    /// Whether a run is tracked.
    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().unwrap().contains_key(run_id)
    }

    /// Flag a run for cooperative cancellation.
    pub fn set_cancel_requested(&self, run_id: &str) -> bool {
        let mut runs = self.runs.lock().unwrap();
        match runs.get_mut(run_id) {
            Some(record) => {
                record.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// Whether a cancel has been requested for the run.
    pub fn cancel_requested(&self, run_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    /// Drop a run after its result has been reported.
    pub fn remove(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.lock().unwrap().remove(run_id)
    }

    /// Runs in a non-terminal state.
    pub fn count_active(&self) -> usize {
        self.runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Total tracked runs.
    pub fn len(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.runs.lock().unwrap().is_empty()
    }

    /// Snapshot of every tracked run.
    pub fn all(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_run_ids() {
        let manager = StateManager::new();
        assert!(manager.add("r1", "t1", None));
        assert!(!manager.add("r1", "t2", None));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn normal_lifecycle_transitions() {
        let manager = StateManager::new();
        manager.add("r1", "t1", Some("rc-1"));

        assert!(manager.transition("r1", RunState::Preparing));
        assert!(manager.transition("r1", RunState::Running));
        assert!(manager.transition("r1", RunState::Completed));

        let record = manager.get("r1").unwrap();
        assert_eq!(record.state, RunState::Completed);
        assert_eq!(record.receipt.as_deref(), Some("rc-1"));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let manager = StateManager::new();
        manager.add("r1", "t1", None);
        manager.transition("r1", RunState::Cancelled);

        assert!(!manager.transition("r1", RunState::Running));
        assert!(!manager.transition("r1", RunState::Failed));
        assert_eq!(manager.get("r1").unwrap().state, RunState::Cancelled);
    }

    #[test]
    fn queued_cannot_jump_to_running() {
        let manager = StateManager::new();
        manager.add("r1", "t1", None);
        assert!(!manager.transition("r1", RunState::Running));
        assert_eq!(manager.get("r1").unwrap().state, RunState::Queued);
    }

    #[test]
    fn active_count_excludes_terminal_runs() {
        let manager = StateManager::new();
        manager.add("r1", "t1", None);
        manager.add("r2", "t2", None);
        manager.add("r3", "t3", None);
        manager.transition("r3", RunState::Cancelled);

        assert_eq!(manager.count_active(), 2);
        manager.remove("r3");
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn cancel_flag_round_trips() {
        let manager = StateManager::new();
        manager.add("r1", "t1", None);
        assert!(!manager.cancel_requested("r1"));
        assert!(manager.set_cancel_requested("r1"));
        assert!(manager.cancel_requested("r1"));
        assert!(!manager.set_cancel_requested("missing"));
    }
}
