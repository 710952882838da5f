//! Error types for the orchestration core.

use uuid::Uuid;

/// Top-level error type for the orchestrator.
///
/// Callers composing queue, workflow, and store operations in one function
/// can bubble any subsystem error through it with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Communication error: {0}")]
    Comm(#[from] CommError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid job: {reason}")]
    Validation { reason: String },
}

/// Workflow engine errors.
///
/// These cover programmer errors only (malformed input, unknown ids).
/// Business failures — a task exhausting its retries, a saga rolling back —
/// are reported inside `WorkflowResult`, never through this enum.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("Workflow {id} not found")]
    NotFound { id: Uuid },

    #[error("Workflow {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("No checkpoint snapshot found for workflow {id}")]
    SnapshotNotFound { id: Uuid },
}

/// Agent communication errors.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Mailbox for agent {agent} is closed")]
    MailboxClosed { agent: String },
}

/// Persistence errors from the injected store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_errors_bubble_into_the_top_level() {
        let err: Error = QueueError::Validation {
            reason: "job name must not be empty".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Queue(QueueError::Validation { .. })));
        assert_eq!(
            err.to_string(),
            "Queue error: Invalid job: job name must not be empty"
        );
    }

    #[test]
    fn workflow_errors_carry_the_id() {
        let id = Uuid::new_v4();
        let err: Error = WorkflowError::SnapshotNotFound { id }.into();
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn question_mark_converts_store_errors() {
        fn persist() -> Result<()> {
            Err(StoreError::Backend("disk full".to_string()))?;
            Ok(())
        }
        assert!(matches!(persist(), Err(Error::Store(_))));
    }
}
