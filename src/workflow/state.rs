//! Workflow state machine, snapshots, and structured outcomes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Defined but not yet started.
    Pending,
    /// Phases are executing.
    Running,
    /// Paused between scheduling decisions; resumable.
    Paused,
    /// All tasks completed.
    Completed,
    /// A task failed (saga: after compensation ran).
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl WorkflowState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Paused) | (Running, Completed) |
            (Running, Failed) | (Running, Cancelled) |
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one task within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_role: String,
    /// Backing job id in the task queue, if the task was submitted.
    pub job_id: Option<Uuid>,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub retry_count: u32,
    pub completed_at: DateTime<Utc>,
}

/// Persisted checkpoint of workflow progress.
///
/// Storage-agnostic plain record: a file, object store, or database row
/// are all valid backings. Written only after every task success it
/// mentions has been durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: Uuid,
    pub state: WorkflowState,
    /// Completed task ids in completion order (order preserved so a
    /// resumed run can still compensate correctly).
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    /// Serialized shared context at checkpoint time, if any.
    pub shared_context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn new(workflow_id: Uuid, state: WorkflowState) -> Self {
        Self {
            workflow_id,
            state,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            shared_context: None,
            timestamp: Utc::now(),
        }
    }
}

/// Structured outcome of a workflow run. Business failures live here —
/// the engine's public methods never return Err for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub success: bool,
    pub task_results: HashMap<String, TaskResult>,
    pub total_execution_time: Duration,
    pub errors: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Derived progress figures for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(WorkflowState::Pending.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Paused));
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Failed));
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!WorkflowState::Completed.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Failed.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Pending.can_transition_to(WorkflowState::Paused));
        assert!(!WorkflowState::Cancelled.can_transition_to(WorkflowState::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
    }

    #[test]
    fn snapshot_serde_roundtrip() {
        let mut snapshot = WorkflowSnapshot::new(Uuid::new_v4(), WorkflowState::Running);
        snapshot.completed_task_ids = vec!["a".to_string(), "b".to_string()];
        snapshot.shared_context = Some(serde_json::json!({"version": 2}));

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: WorkflowSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.completed_task_ids, snapshot.completed_task_ids);
        assert_eq!(parsed.state, WorkflowState::Running);
    }
}
