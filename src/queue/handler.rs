//! Job handler capability interface.
//!
//! Handlers are opaque, injected units of work. The queue supplies a
//! [`JobContext`] with the job's identity, metadata, and a progress
//! reporter; the handler returns a JSON payload or a [`JobFailure`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-attempt failure reported by a handler.
///
/// This is the internal outcome of a single attempt; the queue converts the
/// last one into the terminal `JobResult` error string after retries are
/// exhausted. It is never raised to the submitter.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Attempt timed out after {timeout:?}")]
    Timeout { timeout: std::time::Duration },
}

impl JobFailure {
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler(reason.into())
    }
}

/// Context passed to a handler for one attempt.
#[derive(Clone)]
pub struct JobContext {
    /// ID of the job being executed.
    pub job_id: Uuid,
    /// Workflow the job belongs to, if any.
    pub workflow_id: Option<Uuid>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Caller-supplied metadata from the job.
    pub metadata: serde_json::Value,
    /// Progress reporter for this job.
    pub progress: ProgressHandle,
}

/// A unit of async work executed by the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt. The queue enforces the job's timeout around
    /// this call; handlers do not need their own deadline logic.
    async fn execute(&self, ctx: &JobContext) -> Result<serde_json::Value, JobFailure>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, JobFailure>> + Send>>;

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnJobHandler {
    f: Box<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>,
}

impl FnJobHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobFailure>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl JobHandler for FnJobHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<serde_json::Value, JobFailure> {
        (self.f)(ctx.clone()).await
    }
}

/// Shared progress registry; handlers and the queue both write through it.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    values: Arc<RwLock<HashMap<Uuid, u8>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a reporter handle bound to one job.
    pub fn handle(&self, job_id: Uuid) -> ProgressHandle {
        ProgressHandle {
            job_id,
            tracker: self.clone(),
        }
    }

    /// Latest reported progress for a job (0–100).
    pub async fn get(&self, job_id: Uuid) -> Option<u8> {
        self.values.read().await.get(&job_id).copied()
    }

    pub(crate) async fn set(&self, job_id: Uuid, value: u8) {
        self.values.write().await.insert(job_id, value.min(100));
    }

    pub(crate) async fn remove(&self, job_id: Uuid) {
        self.values.write().await.remove(&job_id);
    }
}

/// Reporter handed to handlers via [`JobContext`].
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: Uuid,
    tracker: ProgressTracker,
}

impl ProgressHandle {
    /// Report progress for this job, clamped to 0–100.
    pub async fn report(&self, value: u8) {
        self.tracker.set(self.job_id, value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_handler_executes() {
        let handler = FnJobHandler::new(|ctx| async move {
            Ok(serde_json::json!({ "attempt": ctx.attempt }))
        });

        let tracker = ProgressTracker::new();
        let job_id = Uuid::new_v4();
        let ctx = JobContext {
            job_id,
            workflow_id: None,
            attempt: 1,
            metadata: serde_json::Value::Null,
            progress: tracker.handle(job_id),
        };

        let out = handler.execute(&ctx).await.unwrap();
        assert_eq!(out["attempt"], 1);
    }

    #[tokio::test]
    async fn progress_reported_and_clamped() {
        let tracker = ProgressTracker::new();
        let job_id = Uuid::new_v4();
        let handle = tracker.handle(job_id);

        handle.report(42).await;
        assert_eq!(tracker.get(job_id).await, Some(42));

        handle.report(250).await;
        assert_eq!(tracker.get(job_id).await, Some(100));

        tracker.remove(job_id).await;
        assert_eq!(tracker.get(job_id).await, None);
    }
}
