//! Job model and status state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::handler::JobHandler;

/// Scheduling priority of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted but not yet in the ready queue (delayed jobs).
    Pending,
    /// In the ready queue, waiting for a free worker.
    Queued,
    /// A worker is executing the handler.
    Running,
    /// Last attempt failed; waiting out the backoff before re-running.
    Retrying,
    /// Handler finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Removed before any worker picked it up.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) | (Pending, Cancelled) |
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Retrying) |
            (Retrying, Running)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job can still be cancelled cleanly.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A schedulable unit of async work.
///
/// The handler is an opaque injected capability — the queue knows nothing
/// about what it does, only how to run it under the job's timeout and retry
/// policy.
#[derive(Clone)]
pub struct Job {
    /// Unique job ID.
    pub id: Uuid,
    /// Human-readable name (required).
    pub name: String,
    /// The unit of work to execute.
    pub handler: Arc<dyn JobHandler>,
    /// Scheduling priority.
    pub priority: JobPriority,
    /// Number of re-runs allowed after the first failed attempt.
    pub max_retries: u32,
    /// Per-attempt execution timeout.
    pub timeout: Duration,
    /// Base delay for exponential retry backoff.
    pub retry_delay: Duration,
    /// Earliest time the job may start (None = immediately).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Workflow this job belongs to, if any.
    pub workflow_id: Option<Uuid>,
    /// Caller-supplied metadata passed through to the handler.
    pub metadata: serde_json::Value,
}

impl Job {
    /// Create a job with default policy (normal priority, no retries, 60s timeout).
    pub fn new(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            handler,
            priority: JobPriority::Normal,
            max_retries: 0,
            timeout: Duration::from_secs(60),
            retry_delay: Duration::from_millis(100),
            scheduled_at: None,
            workflow_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("workflow_id", &self.workflow_id)
            .finish_non_exhaustive()
    }
}

/// Terminal outcome of a job. Written exactly once; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job this result belongs to.
    pub job_id: Uuid,
    /// Workflow the job belonged to, if any.
    pub workflow_id: Option<Uuid>,
    /// Terminal status (Completed, Failed, or Cancelled).
    pub status: JobStatus,
    /// Handler output on success.
    pub result: Option<serde_json::Value>,
    /// Last error on failure.
    pub error: Option<String>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal status was reached.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock time from first attempt to terminal status.
    pub execution_time: Duration,
    /// Number of re-runs that were performed.
    pub retry_count: u32,
}

impl JobResult {
    /// Build a Completed result.
    pub fn completed(
        job: &Job,
        result: serde_json::Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id: job.id,
            workflow_id: job.workflow_id,
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
            started_at: Some(started_at),
            completed_at,
            execution_time: elapsed_between(started_at, completed_at),
            retry_count,
        }
    }

    /// Build a Failed result carrying the last attempt's error.
    pub fn failed(
        job: &Job,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id: job.id,
            workflow_id: job.workflow_id,
            status: JobStatus::Failed,
            result: None,
            error: Some(error.into()),
            started_at: Some(started_at),
            completed_at,
            execution_time: elapsed_between(started_at, completed_at),
            retry_count,
        }
    }

    /// Build a Cancelled result (job never ran).
    pub fn cancelled(job: &Job) -> Self {
        Self {
            job_id: job.id,
            workflow_id: job.workflow_id,
            status: JobStatus::Cancelled,
            result: None,
            error: None,
            started_at: None,
            completed_at: Utc::now(),
            execution_time: Duration::ZERO,
            retry_count: 0,
        }
    }

    /// Whether the job finished successfully.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    end.signed_duration_since(start)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler::FnJobHandler;

    fn noop_handler() -> Arc<dyn JobHandler> {
        Arc::new(FnJobHandler::new(|_ctx| async {
            Ok(serde_json::Value::Null)
        }))
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        // A running job cannot be cancelled.
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn cancellable_states() {
        assert!(JobStatus::Pending.is_cancellable());
        assert!(JobStatus::Queued.is_cancellable());
        assert!(!JobStatus::Running.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Urgent > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn result_constructors() {
        let job = Job::new("test", noop_handler());
        let started = Utc::now();

        let ok = JobResult::completed(&job, serde_json::json!({"n": 1}), started, 2);
        assert!(ok.is_success());
        assert_eq!(ok.retry_count, 2);
        assert!(ok.error.is_none());

        let err = JobResult::failed(&job, "boom", started, 3);
        assert_eq!(err.status, JobStatus::Failed);
        assert_eq!(err.error.as_deref(), Some("boom"));

        let cancelled = JobResult::cancelled(&job);
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
    }

    #[test]
    fn job_builder() {
        let job = Job::new("build", noop_handler())
            .with_priority(JobPriority::Urgent)
            .with_max_retries(3)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(job.priority, JobPriority::Urgent);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout, Duration::from_secs(5));
    }
}
