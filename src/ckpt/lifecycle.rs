//! Thread-creation correlation and the lightweight "suspend main" path.
//!
//! Every tracked creation records `routine - caller` for the new thread id.
//! Callers mark some of those fingerprints as "of interest"; a thread whose
//! fingerprint is of interest can park the designated main thread in a busy
//! spin inside the suspend handler and later release it.
//!
//! This path shares the suspend signal with full checkpoint rounds but not
//! their state machine. It must not target the main thread while a full round
//! is in progress; nothing enforces that.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use super::registry::ThreadId;
use super::signals;
use crate::pr_debug;

#[derive(Debug, Default)]
struct Correlation {
    /// Overwritten on every creation: thread ids get reused.
    association: HashMap<ThreadId, isize>,
    interest: HashSet<isize>,
    /// Start routines seen before `attach`; never trackable.
    untrackable: HashSet<usize>,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    table: Mutex<Correlation>,
    inited: AtomicBool,
    main: AtomicU64,
    signal: AtomicI32,
    spin: AtomicBool,
    spinning: AtomicBool,
    spins: AtomicU64,
}

static GLOBAL: OnceLock<Lifecycle> = OnceLock::new();

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table used by `Coordinator::init`.
    pub fn global() -> &'static Lifecycle {
        GLOBAL.get_or_init(Lifecycle::new)
    }

    fn table(&self) -> MutexGuard<'_, Correlation> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Designates `main` as the thread the lightweight path suspends, and
    /// starts correlating creations.
    pub fn attach(&self, main: ThreadId, signal: libc::c_int) {
        self.main.store(main as u64, Ordering::SeqCst);
        self.signal.store(signal, Ordering::SeqCst);
        self.inited.store(true, Ordering::SeqCst);
        log::debug!("lifecycle attached, main {:#x}, signal {}", main, signal);
    }

    pub fn is_attached(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main.load(Ordering::SeqCst) as ThreadId
    }

    /// Records the creation of `tid` from call site `caller` with entry point
    /// `routine`.
    pub fn start(&self, tid: ThreadId, caller: usize, routine: usize) {
        let mut table = self.table();
        if !self.is_attached() {
            table.untrackable.insert(routine);
            return;
        }
        let diff = routine.wrapping_sub(caller) as isize;
        table.association.insert(tid, diff);
        log::debug!("Register starting {:#x} with entrydiff {}", tid, diff);
    }

    pub fn end(&self, tid: ThreadId) {
        log::debug!("Register ending {:#x}", tid);
    }

    pub fn watch(&self, fingerprint: isize) -> bool {
        self.table().interest.insert(fingerprint)
    }

    pub fn unwatch(&self, fingerprint: isize) -> bool {
        self.table().interest.remove(&fingerprint)
    }

    pub fn fingerprint(&self, tid: ThreadId) -> Option<isize> {
        self.table().association.get(&tid).copied()
    }

    pub fn untrackable(&self) -> Vec<usize> {
        let mut routines: Vec<_> = self.table().untrackable.iter().copied().collect();
        routines.sort_unstable();
        routines
    }

    /// Whether `tid` was created by a routine someone is waiting on. Unknown
    /// ids are never of interest.
    pub fn wait_for(&self, tid: ThreadId) -> bool {
        if !self.is_attached() {
            return false;
        }
        let table = self.table();
        table
            .association
            .get(&tid)
            .is_some_and(|diff| table.interest.contains(diff))
    }

    /// Parks the main thread if `from` is main itself or a thread of
    /// interest. Returns whether the signal went out.
    pub fn suspend(&self, from: ThreadId) -> bool {
        let main = self.main_thread();
        if !(self.is_attached() && (from == main || self.wait_for(from))) {
            log::debug!("Not suspending because of {:#x}", from);
            return false;
        }

        log::debug!("Suspending main ({:#x}) because of {:#x}", main, from);
        self.spin.store(true, Ordering::SeqCst);
        let err = signals::send(main, self.signal.load(Ordering::SeqCst));
        if err != 0 {
            self.spin.store(false, Ordering::SeqCst);
            log::error!("can't signal main {:#x}: errno {}", main, err);
            return false;
        }
        true
    }

    /// Releases the main thread if `tid` is a thread of interest.
    pub fn resume(&self, tid: ThreadId) -> bool {
        if !self.wait_for(tid) {
            return false;
        }
        if self.spin.swap(false, Ordering::SeqCst) {
            log::debug!("Released main.");
            return true;
        }
        false
    }

    /// Handler body on the main thread: busy-waits while a lightweight
    /// suspension is requested.
    pub(crate) fn spin_if_requested(&self) {
        if !self.spin.load(Ordering::SeqCst) {
            return;
        }
        pr_debug!("main spinning");
        self.spins.fetch_add(1, Ordering::SeqCst);
        self.spinning.store(true, Ordering::SeqCst);
        while self.spin.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        self.spinning.store(false, Ordering::SeqCst);
    }

    pub fn is_spinning(&self) -> bool {
        self.spinning.load(Ordering::SeqCst)
    }

    /// How many times the main thread entered the spin.
    pub fn spin_count(&self) -> u64 {
        self.spins.load(Ordering::SeqCst)
    }
}
