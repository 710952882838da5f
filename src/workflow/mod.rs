//! Workflow orchestration — definitions, state, events, and the engine.
//!
//! Core components:
//! - `definition` — WorkflowDefinition, phases, and agent tasks
//! - `state` — workflow state machine, snapshots, results
//! - `events` — lifecycle event bus and observers
//! - `engine` — the WorkflowEngine execution strategies

pub mod definition;
pub mod engine;
pub mod events;
pub mod state;

pub use definition::{AgentTask, ExecutionMode, Phase, WorkflowDefinition};
pub use engine::{CompensationHandlers, TaskGenerator, WorkflowEngine};
pub use events::{EventBus, EventObserver, EventType, SubscriptionHandle, WorkflowEvent};
pub use state::{
    TaskResult, WorkflowProgress, WorkflowResult, WorkflowSnapshot, WorkflowState,
};
