//! Priority task queue — scheduling, retry, rate limiting, progress.
//!
//! Core components:
//! - `job` — Job model, priority, status state machine, terminal JobResult
//! - `handler` — JobHandler capability trait + progress reporting
//! - `queue` — PriorityTaskQueue worker pool

pub mod handler;
pub mod job;
pub mod queue;

pub use handler::{FnJobHandler, JobContext, JobFailure, JobHandler, ProgressHandle};
pub use job::{Job, JobPriority, JobResult, JobStatus};
pub use queue::{PriorityTaskQueue, QueueStats};
