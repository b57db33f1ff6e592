//! Creation handshake for threads started from Rust.
//!
//! Mirrors what an interception shim does around `pthread_create`: the parent
//! acquires and initializes a record before the child exists, the child waits
//! for the parent to publish its id, registers itself, and only then runs the
//! user closure. Exit (or unwind) goes through `on_exit`.

use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::coordinator::Coordinator;
use super::lock::Futex;
use super::registry::{ThreadId, ThreadRecord};
use crate::pr_err;

/// Per-spawn state shared by parent and child. Outlives the record's claim,
/// so the parent never waits on a record that got recycled.
struct Handshake {
    /// The id slot handed to `initialize_record`.
    id: AtomicU64,
    registered: Futex,
}

/// A thread tracked by a [`Coordinator`].
#[must_use = "dropping a TrackedThread leaves its record for the zombie probe; join or detach it"]
pub struct TrackedThread<T> {
    handle: JoinHandle<T>,
    tid: ThreadId,
    coord: &'static Coordinator,
}

impl<T> TrackedThread<T> {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn thread(&self) -> &thread::Thread {
        self.handle.thread()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Joins the thread, then retires its record.
    pub fn join(self) -> thread::Result<T> {
        let ret = self.handle.join();
        self.coord.reap(self.tid);
        ret
    }

    /// Lets the thread run on its own; its record is retired when it exits.
    pub fn detach(self) {
        self.coord.detach(self.tid);
        drop(self.handle);
    }
}

struct ExitGuard {
    coord: &'static Coordinator,
    tid: ThreadId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.coord.on_exit();
        self.coord.lifecycle().end(self.tid);
    }
}

fn run_tracked<F, T>(
    coord: &'static Coordinator,
    record: &'static ThreadRecord,
    handshake: Arc<Handshake>,
    f: F,
) -> T
where
    F: FnOnce() -> T,
{
    record.go.wait_while_eq(0);
    if let Err(e) = coord.update(record) {
        pr_err!("record {}: {}", record.id(), e);
    }
    handshake.registered.set_and_wake(1);
    drop(handshake);

    let _exit = ExitGuard {
        coord,
        tid: record.tid(),
    };
    f()
}

impl Coordinator {
    /// Spawns a thread that takes part in every suspension round of this
    /// coordinator.
    ///
    /// Returns once the child is registered. The thread's fingerprint is the
    /// distance between the closure's entry point and this call site, so
    /// repeated spawns of the same closure from the same place share it.
    #[track_caller]
    pub fn spawn<F, T>(&'static self, f: F) -> io::Result<TrackedThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let caller = Location::caller() as *const Location<'static> as usize;
        let routine = run_tracked::<F, T> as *const () as usize;

        let handshake = Arc::new(Handshake {
            id: AtomicU64::new(0),
            registered: Futex::new(),
        });
        let record = self.acquire_record();
        let id_slot = handshake.id.as_ptr() as *mut ThreadId;
        unsafe { self.initialize_record(record, id_slot, routine, 0, caller) };

        let child = Arc::clone(&handshake);
        let spawned = thread::Builder::new().spawn(move || run_tracked(self, record, child, f));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("can't spawn tracked thread: {}", e);
                self.abandon(record);
                return Err(e);
            }
        };

        let tid = handle.as_pthread_t() as ThreadId;
        handshake.id.store(tid as u64, Ordering::SeqCst);
        record.go.set_and_wake(1);
        handshake.registered.wait_until(1);

        self.lifecycle().start(tid, caller, routine);
        Ok(TrackedThread {
            handle,
            tid,
            coord: self,
        })
    }
}
