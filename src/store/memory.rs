//! In-memory `StateStore` backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::job::JobResult;
use crate::store::traits::StateStore;
use crate::workflow::state::WorkflowSnapshot;

/// Process-local store backed by `RwLock<HashMap>` maps.
///
/// Suitable for tests and single-process deployments; durable backends
/// implement the same [`StateStore`] trait.
#[derive(Default)]
pub struct MemoryStore {
    results: RwLock<HashMap<Uuid, JobResult>>,
    /// Completion-ordered result ids per workflow.
    by_workflow: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    snapshots: RwLock<HashMap<Uuid, Vec<WorkflowSnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_result(&self, result: JobResult) -> Result<(), StoreError> {
        let mut results = self.results.write().await;
        if results.contains_key(&result.job_id) {
            return Err(StoreError::Backend(format!(
                "result for job {} already recorded",
                result.job_id
            )));
        }
        if let Some(workflow_id) = result.workflow_id {
            self.by_workflow
                .write()
                .await
                .entry(workflow_id)
                .or_default()
                .push(result.job_id);
        }
        results.insert(result.job_id, result);
        Ok(())
    }

    async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError> {
        Ok(self.results.read().await.get(&job_id).cloned())
    }

    async fn list_results(&self, workflow_id: Uuid) -> Result<Vec<JobResult>, StoreError> {
        let results = self.results.read().await;
        let ids = self.by_workflow.read().await;
        Ok(ids
            .get(&workflow_id)
            .map(|ordered| {
                ordered
                    .iter()
                    .filter_map(|id| results.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .entry(snapshot.workflow_id)
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&workflow_id)
            .and_then(|all| all.last().cloned()))
    }
}
