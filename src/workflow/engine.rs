//! Workflow engine: saga compensation, checkpoint/resume, dynamic batches.
//!
//! Task execution delegates to the [`PriorityTaskQueue`] so every task
//! shares one retry/backoff policy: each `AgentTask` becomes a `Job`
//! tagged with the workflow id, and the engine awaits its `JobResult`.
//! Business failures never escape as `Err` — they are folded into the
//! returned [`WorkflowResult`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use crate::comm::AgentCommunicator;
use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::queue::handler::{JobContext, JobHandler};
use crate::queue::job::{Job, JobResult};
use crate::queue::queue::PriorityTaskQueue;
use crate::store::StateStore;
use crate::workflow::definition::{AgentTask, ExecutionMode, Phase, WorkflowDefinition};
use crate::workflow::events::{EventBus, EventObserver, EventType, SubscriptionHandle, WorkflowEvent};
use crate::workflow::state::{
    TaskResult, WorkflowProgress, WorkflowResult, WorkflowSnapshot, WorkflowState,
};

/// Compensation handlers keyed by task id.
pub type CompensationHandlers = HashMap<String, Arc<dyn JobHandler>>;

/// Produces follow-up task batches from accumulated results.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    /// Return the next batch; an empty batch terminates the workflow.
    async fn next_batch(&self, results: &[TaskResult]) -> Vec<AgentTask>;
}

/// Per-run bookkeeping. Single-writer (the engine); freely readable for
/// progress queries.
struct RunState {
    state: WorkflowState,
    /// Completed task ids in completion order (compensation runs in
    /// reverse over this list).
    completed: Vec<String>,
    failed: Vec<String>,
    task_results: HashMap<String, TaskResult>,
    total_tasks: usize,
    started_at: DateTime<Utc>,
}

/// Orchestrates multi-phase agent workflows over the task queue.
pub struct WorkflowEngine {
    config: EngineConfig,
    queue: Arc<PriorityTaskQueue>,
    comm: Arc<AgentCommunicator>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    runs: RwLock<HashMap<Uuid, RunState>>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        queue: Arc<PriorityTaskQueue>,
        comm: Arc<AgentCommunicator>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            queue,
            comm,
            store,
            events: EventBus::new(),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer for one event type.
    pub async fn register_event_handler(
        &self,
        event_type: EventType,
        observer: Arc<dyn EventObserver>,
    ) -> SubscriptionHandle {
        self.events.register(event_type, observer).await
    }

    /// Remove a previously registered observer.
    pub async fn unregister_event_handler(&self, handle: SubscriptionHandle) {
        self.events.unregister(handle).await
    }

    // ── Execution strategies ────────────────────────────────────────

    /// Execute with saga-style failure recovery: on any task failure,
    /// compensation handlers for completed tasks run in reverse
    /// completion order, best-effort.
    pub async fn execute_with_saga_pattern(
        &self,
        definition: WorkflowDefinition,
        compensations: CompensationHandlers,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_phased(definition, compensations, false, HashSet::new())
            .await
    }

    /// Saga execution that additionally persists a snapshot every
    /// `checkpoint_interval` completed tasks.
    pub async fn execute_with_checkpoint_recovery(
        &self,
        definition: WorkflowDefinition,
        compensations: CompensationHandlers,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_phased(definition, compensations, true, HashSet::new())
            .await
    }

    /// Resume a checkpointed workflow from its latest snapshot,
    /// re-executing only tasks absent from `completed_task_ids`.
    ///
    /// Handlers are injected trait objects and cannot be persisted, so
    /// the definition (and compensations) are supplied again; the
    /// snapshot only decides what to skip.
    pub async fn resume_from_checkpoint(
        &self,
        definition: WorkflowDefinition,
        compensations: CompensationHandlers,
    ) -> Result<WorkflowResult, WorkflowError> {
        let workflow_id = definition.workflow_id;
        let snapshot = self
            .store
            .latest_snapshot(workflow_id)
            .await
            .map_err(|e| WorkflowError::InvalidDefinition {
                reason: format!("snapshot load failed: {e}"),
            })?
            .ok_or(WorkflowError::SnapshotNotFound { id: workflow_id })?;

        tracing::info!(
            workflow = %workflow_id,
            completed = snapshot.completed_task_ids.len(),
            "Resuming from checkpoint"
        );
        let skip: HashSet<String> = snapshot.completed_task_ids.iter().cloned().collect();
        self.execute_phased(definition, compensations, true, skip)
            .await
    }

    /// Execute an initial batch, then repeatedly feed accumulated results
    /// to `generator` and execute whatever it returns, until it returns an
    /// empty batch.
    pub async fn execute_dynamic_workflow(
        &self,
        workflow_id: Uuid,
        initial: Vec<AgentTask>,
        generator: Arc<dyn TaskGenerator>,
    ) -> Result<WorkflowResult, WorkflowError> {
        if initial.is_empty() {
            return Err(WorkflowError::InvalidDefinition {
                reason: "initial batch has no tasks".to_string(),
            });
        }

        self.init_run(workflow_id, initial.len()).await;
        self.emit_workflow(EventType::WorkflowStarted, workflow_id).await;

        let mut batch = initial;
        let mut accumulated: Vec<TaskResult> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        loop {
            if let Some(stopped) = self.stopped_state(workflow_id).await {
                errors.push(format!("workflow {stopped} before batch could start"));
                break;
            }

            let results = self.run_batch(workflow_id, &batch).await;
            for result in results {
                if !result.success {
                    if let Some(e) = &result.error {
                        errors.push(format!("task {}: {e}", result.task_id));
                    }
                }
                self.record_task_result(workflow_id, &result).await;
                accumulated.push(result);
            }

            batch = generator.next_batch(&accumulated).await;
            if batch.is_empty() {
                break;
            }
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&workflow_id) {
                run.total_tasks += batch.len();
            }
        }

        let success = errors.is_empty();
        self.finish_run(workflow_id, success).await;
        Ok(self.build_result(workflow_id, success, errors).await)
    }

    // ── Cooperative control ─────────────────────────────────────────

    /// Pause a running workflow. In-flight tasks complete; the engine
    /// declines to start the next wave.
    pub async fn pause(&self, workflow_id: Uuid) -> Result<(), WorkflowError> {
        self.transition(workflow_id, WorkflowState::Paused).await
    }

    /// Resume a paused workflow's scheduling decisions.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), WorkflowError> {
        self.transition(workflow_id, WorkflowState::Running).await
    }

    /// Cancel a workflow. Cooperative: already-running tasks finish.
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), WorkflowError> {
        self.transition(workflow_id, WorkflowState::Cancelled).await
    }

    /// Current state of a workflow run.
    pub async fn get_workflow_state(&self, workflow_id: Uuid) -> Option<WorkflowState> {
        self.runs.read().await.get(&workflow_id).map(|r| r.state)
    }

    /// Progress derived from stored task results.
    pub async fn get_workflow_progress(&self, workflow_id: Uuid) -> Option<WorkflowProgress> {
        let runs = self.runs.read().await;
        let run = runs.get(&workflow_id)?;
        let total = run.total_tasks;
        let completed = run.completed.len();
        let failed = run.failed.len();
        Some(WorkflowProgress {
            total,
            completed,
            failed,
            percentage: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64 * 100.0
            },
        })
    }

    /// Drop run bookkeeping and release the workflow's shared context.
    pub async fn clear_workflow(&self, workflow_id: Uuid) {
        self.runs.write().await.remove(&workflow_id);
        self.comm.clear_context(workflow_id).await;
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn execute_phased(
        &self,
        definition: WorkflowDefinition,
        compensations: CompensationHandlers,
        checkpointed: bool,
        skip: HashSet<String>,
    ) -> Result<WorkflowResult, WorkflowError> {
        definition.validate()?;
        let workflow_id = definition.workflow_id;

        self.init_run(workflow_id, definition.task_count()).await;
        // Seed skipped tasks as already completed so dependency waves,
        // progress, and compensation ordering see them.
        if !skip.is_empty() {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&workflow_id) {
                for task in definition.tasks() {
                    if skip.contains(&task.task_id) {
                        run.completed.push(task.task_id.clone());
                    }
                }
            }
        }
        self.emit_workflow(EventType::WorkflowStarted, workflow_id).await;

        let mut errors: Vec<String> = Vec::new();
        let mut since_checkpoint = 0usize;

        'phases: for phase in &definition.phases {
            for wave in self.waves(workflow_id, phase, &skip).await {
                if let Some(stopped) = self.stopped_state(workflow_id).await {
                    errors.push(format!("workflow {stopped} before phase {}", phase.name));
                    break 'phases;
                }

                let results = self.run_batch(workflow_id, &wave).await;
                let mut failed_here = false;
                for result in results {
                    let ok = result.success;
                    if !ok {
                        failed_here = true;
                        if let Some(e) = &result.error {
                            errors.push(format!("task {}: {e}", result.task_id));
                        }
                    }
                    self.record_task_result(workflow_id, &result).await;
                    if ok {
                        since_checkpoint += 1;
                        if checkpointed && since_checkpoint >= self.config.checkpoint_interval {
                            self.write_checkpoint(workflow_id).await;
                            since_checkpoint = 0;
                        }
                    }
                }

                if failed_here {
                    self.compensate(workflow_id, &compensations).await;
                    self.finish_run(workflow_id, false).await;
                    return Ok(self.build_result(workflow_id, false, errors).await);
                }
            }
        }

        let success = errors.is_empty();
        self.finish_run(workflow_id, success).await;
        Ok(self.build_result(workflow_id, success, errors).await)
    }

    /// Split a phase into dependency-ordered execution waves.
    /// Sequential phases degrade to one task per wave.
    async fn waves(
        &self,
        workflow_id: Uuid,
        phase: &Phase,
        skip: &HashSet<String>,
    ) -> Vec<Vec<AgentTask>> {
        let pending: Vec<&AgentTask> = phase
            .tasks
            .iter()
            .filter(|t| !skip.contains(&t.task_id))
            .collect();

        match phase.mode {
            ExecutionMode::Sequential => pending.into_iter().map(|t| vec![t.clone()]).collect(),
            ExecutionMode::Parallel => {
                let mut done: HashSet<String> = {
                    let runs = self.runs.read().await;
                    runs.get(&workflow_id)
                        .map(|r| r.completed.iter().cloned().collect())
                        .unwrap_or_default()
                };
                let mut remaining = pending;
                let mut waves = Vec::new();
                while !remaining.is_empty() {
                    let (ready, rest): (Vec<&AgentTask>, Vec<&AgentTask>) =
                        remaining.into_iter().partition(|t| {
                            t.dependencies.iter().all(|d| done.contains(d))
                        });
                    if ready.is_empty() {
                        // validate() rejects cycles; unreachable in practice.
                        tracing::warn!(phase = %phase.name, "Unsatisfiable dependencies, dropping remainder");
                        break;
                    }
                    done.extend(ready.iter().map(|t| t.task_id.clone()));
                    waves.push(ready.into_iter().cloned().collect());
                    remaining = rest;
                }
                waves
            }
        }
    }

    /// Run a batch of tasks concurrently, bounded by `max_parallel_tasks`.
    async fn run_batch(&self, workflow_id: Uuid, batch: &[AgentTask]) -> Vec<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tasks.max(1)));
        let futures: Vec<_> = batch
            .iter()
            .map(|task| {
                let semaphore = Arc::clone(&semaphore);
                let task = task.clone();
                async move {
                    // Closed only on Semaphore::close, which we never call.
                    let _permit = semaphore.acquire().await;
                    self.run_task(workflow_id, task).await
                }
            })
            .collect();
        join_all(futures).await
    }

    /// Execute one task through the queue and await its terminal result.
    async fn run_task(&self, workflow_id: Uuid, task: AgentTask) -> TaskResult {
        self.events
            .emit(&WorkflowEvent::task(
                EventType::TaskStarted,
                workflow_id,
                task.task_id.clone(),
                serde_json::json!({ "agent_role": task.agent_role }),
            ))
            .await;

        let timeout = task.timeout.unwrap_or(self.config.task_timeout);
        let max_retries = task.max_retries.unwrap_or(self.config.task_max_retries);
        let job = Job::new(task.task_id.clone(), Arc::clone(&task.handler))
            .with_priority(task.priority)
            .with_timeout(timeout)
            .with_max_retries(max_retries)
            .with_retry_delay(self.config.task_retry_delay)
            .with_workflow(workflow_id)
            .with_metadata(task.metadata.clone());

        let job_id = match self.queue.submit(job).await {
            Ok(id) => id,
            Err(e) => {
                return self.task_failure(&task, None, format!("submission rejected: {e}"));
            }
        };

        // Budget for every attempt plus backoff and queueing delay.
        let wait_budget = timeout * (max_retries + 1) + self.config.task_wait_slack;
        match self.queue.wait_for_job(job_id, wait_budget).await {
            Some(result) => self.task_outcome(&task, result),
            None => self.task_failure(
                &task,
                Some(job_id),
                format!("no result within {wait_budget:?}"),
            ),
        }
    }

    fn task_outcome(&self, task: &AgentTask, result: JobResult) -> TaskResult {
        TaskResult {
            task_id: task.task_id.clone(),
            agent_role: task.agent_role.clone(),
            job_id: Some(result.job_id),
            success: result.is_success(),
            output: result.result,
            error: result.error,
            execution_time: result.execution_time,
            retry_count: result.retry_count,
            completed_at: result.completed_at,
        }
    }

    fn task_failure(&self, task: &AgentTask, job_id: Option<Uuid>, error: String) -> TaskResult {
        TaskResult {
            task_id: task.task_id.clone(),
            agent_role: task.agent_role.clone(),
            job_id,
            success: false,
            output: None,
            error: Some(error),
            execution_time: Duration::ZERO,
            retry_count: 0,
            completed_at: Utc::now(),
        }
    }

    async fn record_task_result(&self, workflow_id: Uuid, result: &TaskResult) {
        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&workflow_id) {
                if result.success {
                    run.completed.push(result.task_id.clone());
                } else {
                    run.failed.push(result.task_id.clone());
                }
                run.task_results
                    .insert(result.task_id.clone(), result.clone());
            }
        }

        let event_type = if result.success {
            EventType::TaskCompleted
        } else {
            EventType::TaskFailed
        };
        self.events
            .emit(&WorkflowEvent::task(
                event_type,
                workflow_id,
                result.task_id.clone(),
                serde_json::json!({
                    "success": result.success,
                    "retry_count": result.retry_count,
                    "error": result.error,
                }),
            ))
            .await;
    }

    /// Run compensation handlers for completed tasks in reverse completion
    /// order. Best-effort: a failing compensation is logged and the rest
    /// still run.
    async fn compensate(&self, workflow_id: Uuid, compensations: &CompensationHandlers) {
        let completed: Vec<String> = {
            let runs = self.runs.read().await;
            runs.get(&workflow_id)
                .map(|r| r.completed.clone())
                .unwrap_or_default()
        };

        for task_id in completed.iter().rev() {
            let Some(handler) = compensations.get(task_id) else {
                continue;
            };
            tracing::info!(workflow = %workflow_id, task = %task_id, "Compensating task");

            let ctx = JobContext {
                job_id: Uuid::new_v4(),
                workflow_id: Some(workflow_id),
                attempt: 1,
                metadata: serde_json::json!({ "compensating": task_id }),
                progress: crate::queue::handler::ProgressTracker::new().handle(Uuid::new_v4()),
            };
            match tokio::time::timeout(self.config.task_timeout, handler.execute(&ctx)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        workflow = %workflow_id,
                        task = %task_id,
                        "Compensation failed: {e}"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        workflow = %workflow_id,
                        task = %task_id,
                        "Compensation timed out after {:?}",
                        self.config.task_timeout
                    );
                }
            }
        }
    }

    async fn write_checkpoint(&self, workflow_id: Uuid) {
        let snapshot = {
            let runs = self.runs.read().await;
            let Some(run) = runs.get(&workflow_id) else {
                return;
            };
            WorkflowSnapshot {
                workflow_id,
                state: run.state,
                completed_task_ids: run.completed.clone(),
                failed_task_ids: run.failed.clone(),
                shared_context: None,
                timestamp: Utc::now(),
            }
        };
        let snapshot = WorkflowSnapshot {
            shared_context: self.comm.export_context(workflow_id).await,
            ..snapshot
        };

        tracing::debug!(
            workflow = %workflow_id,
            completed = snapshot.completed_task_ids.len(),
            "Writing checkpoint"
        );
        if let Err(e) = self.store.save_snapshot(snapshot).await {
            tracing::warn!(workflow = %workflow_id, "Checkpoint write failed: {e}");
        }
    }

    async fn init_run(&self, workflow_id: Uuid, total_tasks: usize) {
        let mut runs = self.runs.write().await;
        runs.insert(
            workflow_id,
            RunState {
                state: WorkflowState::Running,
                completed: Vec::new(),
                failed: Vec::new(),
                task_results: HashMap::new(),
                total_tasks,
                started_at: Utc::now(),
            },
        );
    }

    /// The run's state if it is no longer eligible to start new work.
    /// Paused runs are awaited until resumed or cancelled; a run that has
    /// been cleared mid-flight counts as cancelled.
    async fn stopped_state(&self, workflow_id: Uuid) -> Option<WorkflowState> {
        loop {
            let Some(state) = self.runs.read().await.get(&workflow_id).map(|r| r.state) else {
                return Some(WorkflowState::Cancelled);
            };
            match state {
                WorkflowState::Paused => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                WorkflowState::Cancelled | WorkflowState::Failed => return Some(state),
                _ => return None,
            }
        }
    }

    async fn transition(
        &self,
        workflow_id: Uuid,
        target: WorkflowState,
    ) -> Result<(), WorkflowError> {
        let from = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(&workflow_id)
                .ok_or(WorkflowError::NotFound { id: workflow_id })?;
            if !run.state.can_transition_to(target) {
                return Err(WorkflowError::InvalidTransition {
                    id: workflow_id,
                    state: run.state.to_string(),
                    target: target.to_string(),
                });
            }
            let from = run.state;
            run.state = target;
            from
        };

        tracing::info!(workflow = %workflow_id, "Workflow {from} -> {target}");
        self.events
            .emit(&WorkflowEvent::workflow(
                EventType::StateChanged,
                workflow_id,
                serde_json::json!({ "from": from.to_string(), "to": target.to_string() }),
            ))
            .await;
        Ok(())
    }

    async fn finish_run(&self, workflow_id: Uuid, success: bool) {
        let target = if success {
            WorkflowState::Completed
        } else {
            WorkflowState::Failed
        };
        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&workflow_id) {
                // A cancelled run keeps its state; Failed/Completed apply
                // only to runs that got that far.
                if run.state.can_transition_to(target) {
                    run.state = target;
                }
            }
        }
        let event = if success {
            EventType::WorkflowCompleted
        } else {
            EventType::WorkflowFailed
        };
        self.emit_workflow(event, workflow_id).await;
    }

    async fn emit_workflow(&self, event_type: EventType, workflow_id: Uuid) {
        self.events
            .emit(&WorkflowEvent::workflow(
                event_type,
                workflow_id,
                serde_json::Value::Null,
            ))
            .await;
    }

    async fn build_result(
        &self,
        workflow_id: Uuid,
        success: bool,
        errors: Vec<String>,
    ) -> WorkflowResult {
        let runs = self.runs.read().await;
        let (task_results, total_execution_time) = runs
            .get(&workflow_id)
            .map(|run| {
                let elapsed = Utc::now()
                    .signed_duration_since(run.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                (run.task_results.clone(), elapsed)
            })
            .unwrap_or_default();

        WorkflowResult {
            workflow_id,
            success,
            task_results,
            total_execution_time,
            errors,
            metadata: serde_json::Value::Null,
        }
    }
}
