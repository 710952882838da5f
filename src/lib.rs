//! Conductor — concurrent job and workflow orchestration.

pub mod comm;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod workflow;
