//! Watch tasks and the registry that owns their lifecycle

pub mod events;
pub mod registry;
pub mod types;

pub use events::EngineEvent;
pub use registry::{Completion, Conflict, TaskRegistry};
pub use types::*;
