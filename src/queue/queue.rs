//! Priority task queue — worker pool, retry/backoff, rate limiting.
//!
//! Jobs are held in a max-heap ordered by priority, with a monotonically
//! increasing sequence number as FIFO tie-break within a priority level.
//! N worker loops pop from the heap and run handlers under each job's
//! timeout; a scheduler loop promotes delayed jobs once they come due.
//! Cancellation is cooperative: a queued job is skipped on pop, a running
//! job is never interrupted.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::handler::{JobContext, JobFailure, ProgressTracker};
use crate::queue::job::{Job, JobPriority, JobResult, JobStatus};
use crate::store::StateStore;

/// Heap entry: highest priority first, FIFO within a priority level.
struct QueuedEntry {
    priority: JobPriority,
    seq: u64,
    job_id: Uuid,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower sequence wins within a priority level (reversed for max-heap).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Tracked job plus its mutable status. Single-writer: only the queue
/// mutates the status; readers get eventually-consistent snapshots.
struct JobRecord {
    job: Job,
    status: JobStatus,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub running: usize,
}

struct QueueInner {
    config: QueueConfig,
    store: Arc<dyn StateStore>,
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    /// Jobs waiting for their `scheduled_at` to come due.
    delayed: Mutex<Vec<Uuid>>,
    seq: AtomicU64,
    /// Wakes idle workers when work arrives.
    work_available: Notify,
    /// Start timestamps within the rolling rate-limit window.
    rate_window: Mutex<VecDeque<Instant>>,
    progress: ProgressTracker,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    running: AtomicU64,
}

/// Priority job queue with a cooperative worker pool.
pub struct PriorityTaskQueue {
    inner: Arc<QueueInner>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityTaskQueue {
    /// Create a queue over the given store. Call [`start`](Self::start)
    /// before submitting work.
    pub fn new(config: QueueConfig, store: Arc<dyn StateStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                heap: Mutex::new(BinaryHeap::new()),
                jobs: RwLock::new(HashMap::new()),
                delayed: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                work_available: Notify::new(),
                rate_window: Mutex::new(VecDeque::new()),
                progress: ProgressTracker::new(),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                running: AtomicU64::new(0),
            }),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops and the delayed-job scheduler.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        // start() after stop() resumes on the same queue state.
        let _ = self.shutdown_tx.send(false);

        for worker_id in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, inner, shutdown).await;
            }));
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            scheduler_loop(inner, shutdown).await;
        }));

        tracing::info!(workers = self.inner.config.workers, "Task queue started");
    }

    /// Stop the pool: workers finish their current job, then exit.
    /// In-flight handlers are drained, never aborted.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.work_available.notify_waiters();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("Worker task join failed: {e}");
            }
        }
        tracing::info!("Task queue stopped");
    }

    /// Submit a job for execution. Returns immediately with the job id.
    ///
    /// Jobs with a future `scheduled_at` are parked until the scheduler
    /// observes they are due.
    pub async fn submit(&self, job: Job) -> Result<Uuid, QueueError> {
        validate(&job)?;

        let job_id = job.id;
        let delayed = job
            .scheduled_at
            .map(|at| at > Utc::now())
            .unwrap_or(false);
        let status = if delayed {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        };
        let priority = job.priority;

        {
            let mut jobs = self.inner.jobs.write().await;
            jobs.insert(job_id, JobRecord { job, status });
        }
        self.inner.submitted.fetch_add(1, AtomicOrdering::Relaxed);

        if delayed {
            self.inner.delayed.lock().await.push(job_id);
            tracing::debug!(job = %job_id, "Job parked until scheduled time");
        } else {
            self.inner.enqueue(job_id, priority).await;
        }

        Ok(job_id)
    }

    /// Defer a job until `at`, then submit it.
    pub async fn schedule(
        &self,
        mut job: Job,
        at: chrono::DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        job.scheduled_at = Some(at);
        self.submit(job).await
    }

    /// Cancel a job. Returns true only if it was still Pending or Queued;
    /// a Running job cannot be interrupted and false is returned.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let mut jobs = self.inner.jobs.write().await;
        let Some(record) = jobs.get_mut(&job_id) else {
            return false;
        };
        if !record.status.is_cancellable() {
            return false;
        }

        record.status = JobStatus::Cancelled;
        let result = JobResult::cancelled(&record.job);
        drop(jobs);

        self.inner.delayed.lock().await.retain(|id| *id != job_id);
        // The heap entry, if any, is skipped lazily when popped.
        if let Err(e) = self.inner.store.save_result(result).await {
            tracing::warn!(job = %job_id, "Failed to record cancellation: {e}");
        }
        self.inner.cancelled.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::info!(job = %job_id, "Job cancelled");
        true
    }

    /// Current status of a job, if known.
    pub async fn get_job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.inner.jobs.read().await.get(&job_id).map(|r| r.status)
    }

    /// Terminal result of a job, if one has been recorded.
    pub async fn get_job_result(&self, job_id: Uuid) -> Option<JobResult> {
        self.inner.store.get_result(job_id).await.ok().flatten()
    }

    /// Latest reported progress (0–100) for a job.
    pub async fn get_progress(&self, job_id: Uuid) -> Option<u8> {
        self.inner.progress.get(job_id).await
    }

    /// Suspend until the job has a terminal result, or `timeout` elapses.
    /// Timing out has no side effects on the job; `None` means "not yet".
    pub async fn wait_for_job(&self, job_id: Uuid, timeout: Duration) -> Option<JobResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(result)) = self.inner.store.get_result(job_id).await {
                return Some(result);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.inner.config.wait_poll_interval).await;
        }
    }

    /// Suspend until every job submitted under `workflow_id` has a terminal
    /// result, or `timeout` elapses.
    pub async fn wait_for_workflow(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> Option<Vec<JobResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            let expected = {
                let jobs = self.inner.jobs.read().await;
                jobs.values()
                    .filter(|r| r.job.workflow_id == Some(workflow_id))
                    .count()
            };
            if expected > 0 {
                if let Ok(results) = self.inner.store.list_results(workflow_id).await {
                    if results.len() >= expected {
                        return Some(results);
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.inner.config.wait_poll_interval).await;
        }
    }

    /// Snapshot of queue counters.
    pub async fn queue_stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.inner.submitted.load(AtomicOrdering::Relaxed),
            completed: self.inner.completed.load(AtomicOrdering::Relaxed),
            failed: self.inner.failed.load(AtomicOrdering::Relaxed),
            cancelled: self.inner.cancelled.load(AtomicOrdering::Relaxed),
            queued: self.inner.heap.lock().await.len(),
            running: self.inner.running.load(AtomicOrdering::Relaxed) as usize,
        }
    }

    /// Number of jobs currently executing.
    pub fn running_count(&self) -> usize {
        self.inner.running.load(AtomicOrdering::Relaxed) as usize
    }
}

fn validate(job: &Job) -> Result<(), QueueError> {
    if job.name.trim().is_empty() {
        return Err(QueueError::Validation {
            reason: "job name must not be empty".to_string(),
        });
    }
    if job.timeout.is_zero() {
        return Err(QueueError::Validation {
            reason: "job timeout must be nonzero".to_string(),
        });
    }
    Ok(())
}

impl QueueInner {
    async fn enqueue(&self, job_id: Uuid, priority: JobPriority) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(QueuedEntry {
            priority,
            seq,
            job_id,
        });
        self.work_available.notify_one();
    }

    /// Pop the highest-priority job that is still Queued. The job stays
    /// Queued until [`claim_running`](Self::claim_running) succeeds, so it
    /// remains cancellable while waiting for a rate slot.
    async fn pop_ready(&self) -> Option<Job> {
        loop {
            let entry = self.heap.lock().await.pop()?;
            let jobs = self.jobs.read().await;
            match jobs.get(&entry.job_id) {
                Some(record) if record.status == JobStatus::Queued => {
                    return Some(record.job.clone());
                }
                // Cancelled (or already gone) while queued: skip.
                _ => continue,
            }
        }
    }

    /// Mark a popped job Running, atomically with respect to concurrent
    /// cancels. False means the job was cancelled before it could start.
    async fn claim_running(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(record) if record.status == JobStatus::Queued => {
                record.status = JobStatus::Running;
                true
            }
            _ => false,
        }
    }

    async fn set_status(&self, job_id: Uuid, target: JobStatus) {
        let mut jobs = self.jobs.write().await;
        if let Some(record) = jobs.get_mut(&job_id) {
            if record.status == target || record.status.can_transition_to(target) {
                record.status = target;
            } else {
                tracing::warn!(
                    job = %job_id,
                    "Ignoring invalid status transition {} -> {}",
                    record.status,
                    target
                );
            }
        }
    }

    /// Block until the rolling one-second window has start capacity.
    /// Over-cap jobs are delayed, never dropped.
    async fn acquire_rate_slot(&self) {
        let Some(cap) = self.config.rate_limit_per_second else {
            return;
        };
        loop {
            let wait = {
                let now = Instant::now();
                let mut window = self.rate_window.lock().await;
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
                {
                    window.pop_front();
                }
                if window.len() < cap as usize {
                    window.push_back(now);
                    return;
                }
                // Window is non-empty here, otherwise len() < cap above.
                Duration::from_secs(1).saturating_sub(now.duration_since(window[0]))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Run a job to its terminal state: attempts, backoff, result write.
    async fn run_job(&self, job: Job) {
        let job_id = job.id;
        let started_at = Utc::now();
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        self.running.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(job = %job_id, name = %job.name, "Job started");

        loop {
            attempt += 1;
            if attempt > 1 {
                self.set_status(job_id, JobStatus::Running).await;
            }

            let ctx = JobContext {
                job_id,
                workflow_id: job.workflow_id,
                attempt,
                metadata: job.metadata.clone(),
                progress: self.progress.handle(job_id),
            };

            match tokio::time::timeout(job.timeout, job.handler.execute(&ctx)).await {
                Ok(Ok(value)) => {
                    let retry_count = attempt - 1;
                    self.progress.set(job_id, 100).await;
                    self.set_status(job_id, JobStatus::Completed).await;
                    let result = JobResult::completed(&job, value, started_at, retry_count);
                    if let Err(e) = self.store.save_result(result).await {
                        tracing::warn!(job = %job_id, "Failed to record result: {e}");
                    }
                    self.completed.fetch_add(1, AtomicOrdering::Relaxed);
                    self.running.fetch_sub(1, AtomicOrdering::Relaxed);
                    tracing::info!(job = %job_id, retries = retry_count, "Job completed");
                    return;
                }
                Ok(Err(failure)) => {
                    last_error = failure.to_string();
                }
                Err(_) => {
                    last_error = JobFailure::Timeout {
                        timeout: job.timeout,
                    }
                    .to_string();
                }
            }

            if attempt > job.max_retries {
                let retry_count = attempt - 1;
                self.set_status(job_id, JobStatus::Failed).await;
                let result = JobResult::failed(&job, &last_error, started_at, retry_count);
                if let Err(e) = self.store.save_result(result).await {
                    tracing::warn!(job = %job_id, "Failed to record result: {e}");
                }
                self.failed.fetch_add(1, AtomicOrdering::Relaxed);
                self.running.fetch_sub(1, AtomicOrdering::Relaxed);
                tracing::warn!(
                    job = %job_id,
                    retries = retry_count,
                    error = %last_error,
                    "Job failed"
                );
                return;
            }

            self.set_status(job_id, JobStatus::Retrying).await;
            let backoff = job.retry_delay * 2u32.saturating_pow(attempt - 1);
            tracing::debug!(
                job = %job_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %last_error,
                "Job attempt failed, backing off"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// One logical worker: runs at most one job at a time.
async fn worker_loop(
    worker_id: usize,
    inner: Arc<QueueInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker = worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match inner.pop_ready().await {
            Some(job) => {
                inner.acquire_rate_slot().await;
                // Cancelled while waiting for a rate slot: the cancel
                // already wrote the terminal result, skip.
                if inner.claim_running(job.id).await {
                    inner.run_job(job).await;
                }
            }
            None => {
                tokio::select! {
                    _ = inner.work_available.notified() => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(inner.config.idle_poll_interval) => {}
                }
            }
        }
    }
    tracing::debug!(worker = worker_id, "Worker stopped");
}

/// Promotes delayed jobs into the ready heap once they come due.
async fn scheduler_loop(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let due: Vec<Uuid> = {
            let now = Utc::now();
            let jobs = inner.jobs.read().await;
            let mut delayed = inner.delayed.lock().await;
            let mut due = Vec::new();
            delayed.retain(|id| match jobs.get(id) {
                Some(record) if record.status == JobStatus::Pending => {
                    let is_due = record
                        .job
                        .scheduled_at
                        .map(|at| at <= now)
                        .unwrap_or(true);
                    if is_due {
                        due.push(*id);
                    }
                    !is_due
                }
                // Cancelled or unknown: drop from the delayed list.
                _ => false,
            });
            due
        };

        for job_id in due {
            let priority = {
                let mut jobs = inner.jobs.write().await;
                match jobs.get_mut(&job_id) {
                    Some(record) if record.status == JobStatus::Pending => {
                        record.status = JobStatus::Queued;
                        Some(record.job.priority)
                    }
                    _ => None,
                }
            };
            if let Some(priority) = priority {
                tracing::debug!(job = %job_id, "Delayed job is due");
                inner.enqueue(job_id, priority).await;
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(inner.config.scheduler_tick) => {}
        }
    }
}
