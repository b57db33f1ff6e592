//! Per-thread lifecycle states and the state mutex.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use super::lock::Mutex;

/// Where a tracked thread is in the suspend cycle.
///
/// `Running -> Signaled -> Suspending -> Suspended -> Running` is the normal
/// round; `Running -> Zombie` when the thread routine returns. The coordinator
/// thread sits in `Coordinator` and is never signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Signaled,
    Suspending,
    Suspended,
    Zombie,
    Coordinator,
}

impl ThreadState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Running,
            1 => Self::Signaled,
            2 => Self::Suspending,
            3 => Self::Suspended,
            4 => Self::Zombie,
            5 => Self::Coordinator,
            _ => return None,
        })
    }

    /// States in which a thread is inside the suspend handler and will post an
    /// arrival.
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Suspending | Self::Suspended)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Signaled => "signaled",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Zombie => "zombie",
            Self::Coordinator => "coordinator",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`ThreadState`]. Reads are lock-free; writes go
/// through [`StateLock`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new(state: ThreadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ThreadState {
        let raw = self.0.load(Ordering::SeqCst);
        match ThreadState::from_raw(raw) {
            Some(state) => state,
            None => crate::ckpt::log::bug(file!(), line!(), "corrupt thread state"),
        }
    }

    fn set(&self, state: ThreadState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// The state mutex. Totally orders every state change of every record of one
/// coordinator.
///
/// Lock order: list mutex before state mutex, never the reverse.
#[derive(Default)]
pub struct StateLock {
    lock: Mutex,
}

impl StateLock {
    pub const fn new() -> Self {
        Self { lock: Mutex::new() }
    }

    /// Moves `cell` from `from` to `to` if it currently holds `from`.
    /// Returns whether the move applied.
    pub fn transition(&self, cell: &StateCell, from: ThreadState, to: ThreadState) -> bool {
        self.lock.lock();
        let applied = cell.get() == from;
        if applied {
            cell.set(to);
        }
        self.lock.unlock();
        applied
    }

    /// Unconditional store, for records nobody else can see yet.
    pub fn force(&self, cell: &StateCell, to: ThreadState) {
        self.lock.lock();
        cell.set(to);
        self.lock.unlock();
    }
}
