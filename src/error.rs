use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CkptError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Can't install handler for signal {signal}: {source}")]
    Signal {
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },

    #[error("Only the coordinator thread may do this")]
    NotCoordinator,

    #[error("Thread is already bound to a coordinator")]
    AlreadyBound,

    #[error("Coordinator already initialized")]
    AlreadyInitialized,

    #[error("No checkpoint was taken yet")]
    NoCheckpoint,

    #[error("Checkpoint image failure: {reason}")]
    Image { reason: String },
}

pub type Result<T> = std::result::Result<T, CkptError>;
