//! Persistence seam for results and checkpoints.
//!
//! - `traits` — backend-agnostic `StateStore` interface
//! - `memory` — process-local `RwLock<HashMap>` backend

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::StateStore;
