//! Inter-agent communication — mailboxes, broadcast, shared context.
//!
//! Core components:
//! - `message` — AgentMessage model and constructors
//! - `context` — per-workflow versioned SharedContext with advisory locks
//! - `communicator` — the AgentCommunicator bus

pub mod communicator;
pub mod context;
pub mod message;

pub use communicator::{AgentCommunicator, HistoryFilter};
pub use context::SharedContext;
pub use message::{AgentMessage, MessagePriority, MessageType};
