//! Stop-the-world coordination: the suspend/resume protocol, the suspend
//! handler body, checkpoint/restore and the thread-lifecycle entry points the
//! interception shim calls.
//!
//! One coordinator instance owns a registry, a state mutex, the resume gate
//! and the two barrier semaphores. Each tracked thread is bound to its
//! instance and record through a thread-local, which is all the signal
//! handler has to go on.

use std::cell::Cell;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use freezeframe_context::save_context;

use super::lifecycle::Lifecycle;
use super::lock::{Mutex, ResumeGate, Semaphore, SemaphoreStats};
use super::log::log_init;
use super::options::{opts, CkptOpts};
use super::registry::{Registry, ThreadId, ThreadRecord, ThreadSnapshot};
use super::signals::{self, BlockedSignal};
use super::state::{StateLock, ThreadState};
use crate::error::{CkptError, Result};
use crate::image::{CheckpointImage, FrozenProcess, Outcome};
use crate::{bug_on, pr_debug, pr_err, pr_info};

#[derive(Clone, Copy)]
struct Current {
    coord: &'static Coordinator,
    record: &'static ThreadRecord,
}

thread_local! {
    static CURRENT: Cell<Option<Current>> = const { Cell::new(None) };
}

fn current() -> Option<Current> {
    CURRENT.with(|c| c.get())
}

fn bind(coord: &'static Coordinator, record: &'static ThreadRecord) -> Result<()> {
    CURRENT.with(|c| match c.get() {
        Some(cur) if !std::ptr::eq(cur.record, record) => Err(CkptError::AlreadyBound),
        _ => {
            c.set(Some(Current { coord, record }));
            Ok(())
        }
    })
}

fn unbind() {
    CURRENT.with(|c| c.set(None));
}

fn pthread_self() -> ThreadId {
    unsafe { libc::pthread_self() }
}

static GLOBAL: OnceLock<&'static Coordinator> = OnceLock::new();
static GLOBAL_INIT: Mutex = Mutex::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// "Reached suspended" and "revived" notifications.
    pub arrivals: SemaphoreStats,
    /// Restore completion releases.
    pub releases: SemaphoreStats,
    /// Threads counted by the last suspension round.
    pub expected: usize,
    pub rounds: u64,
}

pub struct Coordinator {
    registry: Registry,
    states: StateLock,
    gate: ResumeGate,
    arrivals: Semaphore,
    released: Semaphore,
    expected: AtomicUsize,
    restore_in_progress: AtomicBool,
    checkpointed: AtomicBool,
    torn_down: AtomicBool,
    rounds: AtomicU64,
    signal: libc::c_int,
    rescan_interval: Duration,
    lifecycle: &'static Lifecycle,
    record: &'static ThreadRecord,
}

impl Coordinator {
    /// Sets up the process-wide coordinator from the global options, with the
    /// calling thread as coordinator.
    pub fn init() -> Result<&'static Coordinator> {
        GLOBAL_INIT.lock();
        let ret = Self::init_locked();
        GLOBAL_INIT.unlock();
        ret
    }

    fn init_locked() -> Result<&'static Coordinator> {
        if GLOBAL.get().is_some() {
            return Err(CkptError::AlreadyInitialized);
        }
        let opts = opts();
        log_init(opts.log_file.as_deref(), opts.log_level)?;
        let coord = Self::create(opts, Lifecycle::global())?;
        if GLOBAL.set(coord).is_err() {
            return Err(CkptError::AlreadyInitialized);
        }
        Ok(coord)
    }

    /// The instance built by [`Coordinator::init`], if any.
    pub fn global() -> Option<&'static Coordinator> {
        GLOBAL.get().copied()
    }

    /// The instance the calling thread is tracked by, if any.
    pub fn current() -> Option<&'static Coordinator> {
        current().map(|cur| cur.coord)
    }

    /// Builds an independent instance with the calling thread as coordinator.
    /// The instance lives until process exit.
    pub fn create(opts: &CkptOpts, lifecycle: &'static Lifecycle) -> Result<&'static Coordinator> {
        if current().is_some() {
            return Err(CkptError::AlreadyBound);
        }
        signals::install(opts.suspend_signal)?;

        let registry = Registry::new();
        let record = registry.acquire();
        record.reset(std::ptr::null_mut(), 0, 0, 0);
        record.set_tid(pthread_self());
        record.set_kernel_tid(signals::kernel_tid());

        let coord: &'static Coordinator = Box::leak(Box::new(Coordinator {
            registry,
            states: StateLock::new(),
            gate: ResumeGate::new(),
            arrivals: Semaphore::new(),
            released: Semaphore::new(),
            expected: AtomicUsize::new(0),
            restore_in_progress: AtomicBool::new(false),
            checkpointed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            rounds: AtomicU64::new(0),
            signal: opts.suspend_signal,
            rescan_interval: opts.rescan_interval,
            lifecycle,
            record,
        }));

        coord.states.force(&record.state, ThreadState::Coordinator);
        coord.registry.register(record);
        bind(coord, record)?;
        lifecycle.attach(pthread_self(), opts.suspend_signal);

        log::info!(
            "coordinator {:#x} ready, signal {}, rescan every {:?}",
            pthread_self(),
            coord.signal,
            coord.rescan_interval
        );
        Ok(coord)
    }

    fn ensure_coordinator(&self) -> Result<()> {
        match current() {
            Some(cur)
                if std::ptr::eq(cur.coord, self)
                    && std::ptr::eq(cur.record, self.record)
                    && !self.torn_down.load(Ordering::SeqCst) =>
            {
                Ok(())
            }
            _ => Err(CkptError::NotCoordinator),
        }
    }

    pub fn signal(&self) -> libc::c_int {
        self.signal
    }

    pub fn lifecycle(&self) -> &'static Lifecycle {
        self.lifecycle
    }

    pub fn coordinator_tid(&self) -> ThreadId {
        self.record.tid()
    }

    fn transition(&self, record: &ThreadRecord, from: ThreadState, to: ThreadState) -> bool {
        self.states.transition(&record.state, from, to)
    }

    /// Blocks the suspend signal if the caller is one of our tracked threads,
    /// so it can't be frozen in the middle of a registry mutation.
    fn block_if_tracked(&self) -> Option<BlockedSignal> {
        match current() {
            Some(cur) if std::ptr::eq(cur.coord, self) => Some(BlockedSignal::new(self.signal)),
            _ => None,
        }
    }

    //
    // Thread lifecycle entry points
    //

    /// Hands out a record for a thread about to be created.
    pub fn acquire_record(&self) -> &'static ThreadRecord {
        let _blocked = self.block_if_tracked();
        self.registry.acquire()
    }

    /// Fills a freshly acquired record before the new thread runs user code.
    ///
    /// # Safety
    ///
    /// `id_slot` is either null or points to the creator-owned storage that
    /// will receive the new thread's id, and stays valid until [`update`]
    /// returned on the new thread.
    ///
    /// [`update`]: Coordinator::update
    pub unsafe fn initialize_record(
        &self,
        record: &'static ThreadRecord,
        id_slot: *mut ThreadId,
        routine: usize,
        arg: usize,
        caller: usize,
    ) {
        let _blocked = self.block_if_tracked();
        record.reset(id_slot, routine, arg, caller);
        self.states.force(&record.state, ThreadState::Running);
    }

    /// Puts a record on the active list, retiring any stale record with the
    /// same thread id. Waits out a suspension round in progress, so nothing
    /// joins the list behind the final rescan.
    pub fn register(&self, record: &'static ThreadRecord) {
        let _blocked = self.block_if_tracked();
        loop {
            let mut lists = self.registry.lock();
            if !self.gate.is_closed() {
                lists.register(record);
                return;
            }
            drop(lists);
            self.gate.wait_open();
        }
    }

    /// Called on the new thread once its id is known: fills in the id, binds
    /// the thread to the record and registers it.
    pub fn update(&'static self, record: &'static ThreadRecord) -> Result<()> {
        let slot = record.id_slot();
        let published = if slot.is_null() {
            0
        } else {
            unsafe { std::ptr::read_volatile(slot) }
        };
        let me = pthread_self();
        if published != 0 && published != me {
            pr_err!(
                "record {}: slot says {:#x}, running as {:#x}",
                record.id(),
                published,
                me
            );
        }

        record.set_tid(me);
        record.set_kernel_tid(signals::kernel_tid());
        bind(self, record)?;
        self.register(record);
        pr_debug!("thread {:#x} registered as {}", me, record.id());
        Ok(())
    }

    /// The calling thread's routine returned. Detached threads are retired on
    /// the spot; others wait for [`reap`](Coordinator::reap).
    pub fn on_exit(&self) {
        let Some(cur) = current().filter(|cur| std::ptr::eq(cur.coord, self)) else {
            return;
        };
        let record = cur.record;
        loop {
            let blocked = BlockedSignal::new(self.signal);
            let mut lists = self.registry.lock();
            if self.transition(record, ThreadState::Running, ThreadState::Zombie) {
                if record.is_detached() {
                    lists.retire(record.id());
                }
                drop(lists);
                unbind();
                drop(blocked);
                return;
            }

            let state = record.state();
            drop(lists);
            if state != ThreadState::Signaled {
                pr_err!("record {}: exit in state {}", record.id(), state);
                unbind();
                return;
            }
            // Unblocking delivers the pending suspend signal; the round
            // finishes before we get here again.
            drop(blocked);
            std::thread::yield_now();
        }
    }

    /// Marks the thread `tid` detached, retiring it now if it already exited.
    pub fn detach(&self, tid: ThreadId) -> bool {
        let _blocked = self.block_if_tracked();
        let mut lists = self.registry.lock();
        let Some(record) = lists.find_active(tid) else {
            return false;
        };
        if record.state() == ThreadState::Zombie {
            lists.retire(record.id());
        } else {
            record.set_detached();
        }
        true
    }

    /// Retires the exited, joined thread `tid`.
    pub fn reap(&self, tid: ThreadId) -> bool {
        let _blocked = self.block_if_tracked();
        let mut lists = self.registry.lock();
        match lists.find_active(tid) {
            Some(record) if record.state() == ThreadState::Zombie && !record.is_detached() => {
                lists.retire(record.id())
            }
            _ => false,
        }
    }

    /// Returns a record whose thread could not be created.
    pub fn abandon(&self, record: &'static ThreadRecord) {
        let _blocked = self.block_if_tracked();
        self.registry.retire(record);
    }

    //
    // Suspend/resume protocol
    //

    /// Freezes every tracked thread. Returns how many threads are parked.
    pub fn suspend_all(&self) -> Result<usize> {
        self.ensure_coordinator()?;
        Ok(self.suspend_threads())
    }

    /// Releases every thread frozen by [`suspend_all`](Coordinator::suspend_all).
    pub fn resume_all(&self) -> Result<()> {
        self.ensure_coordinator()?;
        if !self.gate.is_closed() {
            log::warn!("resume_all without a suspended round");
            return Ok(());
        }
        self.resume_threads();
        Ok(())
    }

    fn suspend_threads(&self) -> usize {
        self.restore_in_progress.store(false, Ordering::SeqCst);
        // every arrival of the previous round was consumed
        bug_on!(self.arrivals.value() != 0);
        self.gate.reinit();
        self.gate.write_lock();
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;

        let mut passes = 0u32;
        let expected = loop {
            passes += 1;
            let mut rescan = false;
            let mut count = 0;

            let mut lists = self.registry.lock();
            let mut cursor = lists.first();
            while let Some(record) = cursor {
                cursor = lists.next_of(record.id());
                match record.state() {
                    ThreadState::Running => {
                        if !self.transition(record, ThreadState::Running, ThreadState::Signaled) {
                            rescan = true;
                            continue;
                        }
                        match signals::send(record.tid(), self.signal) {
                            0 => rescan = true,
                            libc::ESRCH => {
                                pr_err!(
                                    "thread {:#x} vanished, retiring {}",
                                    record.tid(),
                                    record.id()
                                );
                                lists.retire(record.id());
                            }
                            err => {
                                pr_err!("signal to {:#x} failed: errno {}", record.tid(), err);
                                bug_on!(err != 0);
                            }
                        }
                    }
                    ThreadState::Zombie => {
                        if !signals::probe(record.kernel_tid()) {
                            pr_err!(
                                "zombie {:#x} no longer exists, retiring {}",
                                record.tid(),
                                record.id()
                            );
                            lists.retire(record.id());
                        }
                    }
                    ThreadState::Signaled => {
                        if signals::probe(record.kernel_tid()) {
                            rescan = true;
                        } else {
                            pr_err!(
                                "signaled {:#x} died, retiring {}",
                                record.tid(),
                                record.id()
                            );
                            lists.retire(record.id());
                        }
                    }
                    ThreadState::Suspending | ThreadState::Suspended => count += 1,
                    ThreadState::Coordinator => {}
                }
            }
            drop(lists);

            if !rescan {
                break count;
            }
            std::thread::sleep(self.rescan_interval);
        };

        self.expected.store(expected, Ordering::SeqCst);
        pr_info!(
            "round {}: {} threads after {} passes",
            round,
            expected,
            passes
        );

        for _ in 0..expected {
            self.arrivals.wait();
        }
        expected
    }

    /// Opens the gate and waits until every released thread has left it,
    /// i.e. is back to running (or on its way into a restored context).
    fn resume_threads(&self) {
        pr_debug!("Resuming all threads");
        self.gate.write_unlock();
        self.gate.wait_drained();
    }

    //
    // Checkpoint/restore
    //

    /// Freezes the process and hands it to `image`.
    ///
    /// Returns [`Outcome::Checkpointed`] on the normal path and
    /// [`Outcome::Restored`] when a later [`restore`](Coordinator::restore)
    /// jumped back in here.
    pub fn checkpoint(&self, image: &mut dyn CheckpointImage) -> Result<Outcome> {
        self.ensure_coordinator()?;
        let suspended = self.suspend_threads();
        let round = self.rounds.load(Ordering::SeqCst);
        self.checkpointed.store(true, Ordering::SeqCst);

        let ret = unsafe { save_context!(self.record.context()) };
        bug_on!(ret != 0);
        if resumed_after_restore() {
            return Ok(Outcome::Restored);
        }

        let saved = image.save(&FrozenProcess { suspended, round });
        if let Err(e) = &saved {
            pr_err!("checkpoint image failed: {}", e);
        }
        self.resume_threads();
        saved.map(|()| Outcome::Checkpointed)
    }

    /// Freezes the process, lets `image` overwrite it, then revives every
    /// thread at its saved execution point. On success control reappears in
    /// the last [`checkpoint`](Coordinator::checkpoint) call instead of
    /// returning.
    pub fn restore(&self, image: &mut dyn CheckpointImage) -> Result<Infallible> {
        self.ensure_coordinator()?;
        if !self.checkpointed.load(Ordering::SeqCst) {
            return Err(CkptError::NoCheckpoint);
        }
        let suspended = self.suspend_threads();
        let round = self.rounds.load(Ordering::SeqCst);

        if let Err(e) = image.load(&FrozenProcess { suspended, round }) {
            pr_err!("restore image failed: {}", e);
            self.resume_threads();
            return Err(e);
        }

        self.restore_in_progress.store(true, Ordering::SeqCst);
        self.resume_threads();
        unsafe { self.record.context().resume() }
    }

    /// Second barrier after a restore: nobody returns to user code before
    /// every expected thread has been revived.
    fn join_restore_barrier(&self, record: &ThreadRecord) {
        if record.state() == ThreadState::Coordinator {
            let expected = self.expected.load(Ordering::SeqCst);
            for _ in 0..expected {
                self.arrivals.wait();
            }
            for _ in 0..expected {
                self.released.post();
            }
            pr_info!("restore complete, {} threads revived", expected);
        } else {
            self.arrivals.post();
            self.released.wait();
        }
    }

    /// Handler body on a tracked, non-coordinator thread.
    fn stop_this_thread(&self, record: &'static ThreadRecord) {
        if !self.transition(record, ThreadState::Signaled, ThreadState::Suspending) {
            return;
        }

        let ret = unsafe { save_context!(record.context()) };
        bug_on!(ret != 0);
        continue_after_capture();
    }

    //
    // Diagnostics
    //

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            arrivals: self.arrivals.stats(),
            releases: self.released.stats(),
            expected: self.expected.load(Ordering::SeqCst),
            rounds: self.rounds.load(Ordering::SeqCst),
        }
    }

    /// Active records, coordinator included. Not for use while threads are
    /// frozen: it allocates.
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        self.registry.snapshot()
    }

    pub fn is_suspended(&self) -> bool {
        self.gate.is_closed()
    }

    /// Stops coordinating: the calling thread is unbound and its record
    /// retired. Tracked threads keep running untracked by any round.
    ///
    /// Pooled records are not released. Bound threads and a handler already
    /// running may still hold `&'static ThreadRecord` references into the
    /// arena, so its memory lives until process exit.
    pub fn teardown(&self) -> Result<()> {
        self.ensure_coordinator()?;
        bug_on!(self.gate.is_closed());
        self.torn_down.store(true, Ordering::SeqCst);
        unbind();
        self.registry.retire(self.record);
        log::info!("coordinator {:#x} torn down", self.record.tid());
        Ok(())
    }
}

#[cold]
fn unbound_capture() -> ! {
    crate::ckpt::log::bug(file!(), line!(), "context captured by an unbound thread")
}

/// Reads the restore flag through the thread-local binding. Called right
/// after a context capture, where nothing held in the frame can be trusted on
/// the second return.
#[inline(never)]
fn resumed_after_restore() -> bool {
    let Some(cur) = current() else {
        unbound_capture()
    };
    if !cur.coord.restore_in_progress.load(Ordering::SeqCst) {
        return false;
    }
    pr_debug!("Resuming after restore");
    cur.coord.join_restore_barrier(cur.record);
    true
}

#[inline(never)]
fn continue_after_capture() {
    let Some(Current { coord, record }) = current() else {
        unbound_capture()
    };

    if coord.restore_in_progress.load(Ordering::SeqCst) {
        // Revived by a restore.
        let revived = coord.transition(record, ThreadState::Suspended, ThreadState::Running)
            || coord.transition(record, ThreadState::Suspending, ThreadState::Running);
        bug_on!(!revived);
        coord.join_restore_barrier(record);
        return;
    }

    let suspended = coord.transition(record, ThreadState::Suspending, ThreadState::Suspended);
    bug_on!(!suspended);
    coord.gate.enter();
    coord.arrivals.post();
    coord.gate.wait_open();

    if coord.restore_in_progress.load(Ordering::SeqCst) {
        coord.gate.leave();
        unsafe { record.context().resume() }
    }

    let running = coord.transition(record, ThreadState::Suspended, ThreadState::Running);
    bug_on!(!running);
    coord.gate.leave();
}

/// Entry from the installed signal handler.
pub(crate) fn handle_suspend_signal(sig: libc::c_int) {
    let Some(cur) = current() else {
        return;
    };
    if cur.coord.signal != sig {
        return;
    }
    if cur.record.state() == ThreadState::Coordinator {
        cur.coord.lifecycle.spin_if_requested();
        return;
    }
    cur.coord.stop_this_thread(cur.record);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated() -> &'static Coordinator {
        let lifecycle: &'static Lifecycle = Box::leak(Box::new(Lifecycle::new()));
        Coordinator::create(&CkptOpts::default(), lifecycle).unwrap()
    }

    #[test]
    fn test_create_binds_caller_as_coordinator() {
        let coord = isolated();
        let threads = coord.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].state, ThreadState::Coordinator);
        assert_eq!(threads[0].tid, pthread_self());
        assert!(coord.lifecycle().is_attached());

        assert!(matches!(
            Coordinator::create(&CkptOpts::default(), coord.lifecycle()),
            Err(CkptError::AlreadyBound)
        ));
        coord.teardown().unwrap();
    }

    #[test]
    fn test_other_threads_are_not_coordinator() {
        let coord = isolated();
        let err = std::thread::spawn(move || coord.suspend_all().unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(err, CkptError::NotCoordinator));
        coord.teardown().unwrap();
        assert!(matches!(
            coord.suspend_all(),
            Err(CkptError::NotCoordinator)
        ));
    }

    #[test]
    fn test_empty_round() {
        let coord = isolated();
        assert_eq!(coord.suspend_all().unwrap(), 0);
        assert!(coord.is_suspended());
        coord.resume_all().unwrap();
        assert!(!coord.is_suspended());
        // no round in progress: warns, does nothing
        coord.resume_all().unwrap();
        assert_eq!(coord.stats().rounds, 1);
        coord.teardown().unwrap();
    }

    #[test]
    fn test_restore_before_checkpoint() {
        let coord = isolated();
        let mut img = crate::image::NullImage::new();
        assert!(matches!(
            coord.restore(&mut img),
            Err(CkptError::NoCheckpoint)
        ));
        assert_eq!(img.loads, 0);
        coord.teardown().unwrap();
    }

    #[test]
    fn test_shim_entry_points_by_hand() {
        let coord = isolated();
        let record = coord.acquire_record();
        unsafe { coord.initialize_record(record, std::ptr::null_mut(), 0x3000, 0, 0x1000) };
        assert_eq!(record.state(), ThreadState::Running);
        assert_eq!(record.fingerprint(), 0x2000);

        // abandoned creation
        coord.abandon(record);
        assert_eq!(coord.threads().len(), 1);
        coord.teardown().unwrap();
    }

    #[test]
    fn test_teardown_keeps_records_pooled() {
        let coord = isolated();
        let spare = coord.acquire_record();
        coord.abandon(spare);
        assert_eq!(coord.registry.lens(), (1, 1));

        coord.teardown().unwrap();
        assert_eq!(coord.registry.lens(), (0, 2));
        assert!(coord.registry.is_free(coord.record));
        // still readable after teardown
        assert_eq!(coord.record.state(), ThreadState::Coordinator);
        assert_eq!(coord.coordinator_tid(), pthread_self());
    }
}
