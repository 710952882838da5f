//! Backend-agnostic `StateStore` trait — single async interface for all
//! orchestration persistence.
//!
//! Job results and workflow snapshots flow through this seam so an
//! in-memory map can be swapped for a durable backend without touching
//! scheduling logic.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::job::JobResult;
use crate::workflow::state::WorkflowSnapshot;

/// Persistence interface for terminal job results and workflow checkpoints.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a terminal job result. Written exactly once per job; a
    /// second write for the same job id is a backend error.
    async fn save_result(&self, result: JobResult) -> Result<(), StoreError>;

    /// Fetch a job result by job ID.
    async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError>;

    /// All results recorded for a workflow, in completion order.
    async fn list_results(&self, workflow_id: Uuid) -> Result<Vec<JobResult>, StoreError>;

    /// Persist a workflow checkpoint snapshot.
    async fn save_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), StoreError>;

    /// The most recent snapshot for a workflow.
    async fn latest_snapshot(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowSnapshot>, StoreError>;
}
