//! Configuration types.

use std::time::Duration;

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Maximum job starts per rolling one-second window (None = unlimited).
    pub rate_limit_per_second: Option<u32>,
    /// How often the scheduler loop checks for due delayed jobs.
    pub scheduler_tick: Duration,
    /// Poll interval used by `wait_for_job` / `wait_for_workflow`.
    pub wait_poll_interval: Duration,
    /// Idle sleep for workers when the queue is empty.
    pub idle_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            rate_limit_per_second: None,
            scheduler_tick: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(25),
            idle_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum tasks running concurrently within a parallel phase.
    pub max_parallel_tasks: usize,
    /// Persist a snapshot every N completed tasks (checkpointed runs).
    pub checkpoint_interval: usize,
    /// Default per-task execution timeout when the task does not override it.
    pub task_timeout: Duration,
    /// Default retry count for tasks submitted to the queue.
    pub task_max_retries: u32,
    /// Default base delay for task retry backoff.
    pub task_retry_delay: Duration,
    /// Extra time the engine waits for a task beyond its own timeout budget
    /// (covers queueing delay and retry backoff).
    pub task_wait_slack: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 5,
            checkpoint_interval: 5,
            task_timeout: Duration::from_secs(300), // 5 minutes
            task_max_retries: 0,
            task_retry_delay: Duration::from_millis(100),
            task_wait_slack: Duration::from_secs(30),
        }
    }
}

/// Agent communicator configuration.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// How long `send` waits for a correlated response.
    pub response_timeout: Duration,
    /// Maximum messages retained in the history ring buffer.
    pub history_limit: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            history_limit: 1000,
        }
    }
}
