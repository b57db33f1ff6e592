// Core modules
pub mod ckpt;
pub mod error;
pub mod image;
pub mod memory;

pub use ckpt::{Coordinator, Lifecycle, ThreadState, TrackedThread};
pub use error::{CkptError, Result};
pub use freezeframe_context::ExecutionContext;
pub use image::{CheckpointImage, FrozenProcess, NullImage, Outcome};
