//! In-process checkpoint coordination.

pub mod coordinator;
pub mod lifecycle;
pub mod lock;
pub mod log;
pub mod options;
pub mod registry;
pub mod signals;
pub mod spawn;
pub mod state;

pub use coordinator::{Coordinator, CoordinatorStats};
pub use lifecycle::Lifecycle;
pub use options::{opts, opts_init, CkptOpts};
pub use registry::{RecordId, ThreadId, ThreadRecord, ThreadSnapshot};
pub use spawn::TrackedThread;
pub use state::ThreadState;
