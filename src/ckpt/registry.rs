//! Thread registry: pooled per-thread records on index-linked active/free
//! chains.
//!
//! Records are leaked on first allocation and recycled through the free chain
//! forever after, so a `&'static ThreadRecord` stays valid for the life of the
//! process and the signal handler never allocates. Links live in the arena,
//! not in the records, and are only touched under the list mutex.

use std::fmt;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering,
};

use freezeframe_context::ExecutionContext;

use super::lock::{Futex, Locked, LockedGuard};
use super::state::{StateCell, ThreadState};
use crate::{bug_on, pr_debug, pr_err};

/// OS-level thread identity as seen by `pthread_kill`.
pub type ThreadId = libc::pthread_t;

/// Stable index of a record in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u32);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct ThreadRecord {
    id: RecordId,
    tid: AtomicU64,
    /// Kernel thread id, used for liveness probes once the thread may be gone.
    ktid: AtomicI32,
    /// Where the creator stores the final thread id once the OS assigned it.
    id_slot: AtomicPtr<ThreadId>,
    pub(crate) state: StateCell,
    detached: AtomicBool,
    start: AtomicUsize,
    arg: AtomicUsize,
    /// Start routine address minus creation call-site address.
    routine_id: AtomicIsize,
    /// Creation handshake: the child runs user code only once this is set.
    pub(crate) go: Futex,
    context: ExecutionContext,
}

impl ThreadRecord {
    fn new(id: RecordId) -> Self {
        Self {
            id,
            tid: AtomicU64::new(0),
            ktid: AtomicI32::new(0),
            id_slot: AtomicPtr::new(std::ptr::null_mut()),
            state: StateCell::new(ThreadState::Running),
            detached: AtomicBool::new(false),
            start: AtomicUsize::new(0),
            arg: AtomicUsize::new(0),
            routine_id: AtomicIsize::new(0),
            go: Futex::new(),
            context: ExecutionContext::new(),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn tid(&self) -> ThreadId {
        self.tid.load(Ordering::SeqCst) as ThreadId
    }

    pub(crate) fn set_tid(&self, tid: ThreadId) {
        self.tid.store(tid as u64, Ordering::SeqCst);
    }

    pub fn kernel_tid(&self) -> libc::pid_t {
        self.ktid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_kernel_tid(&self, ktid: libc::pid_t) {
        self.ktid.store(ktid, Ordering::SeqCst);
    }

    pub(crate) fn id_slot(&self) -> *mut ThreadId {
        self.id_slot.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn start_routine(&self) -> usize {
        self.start.load(Ordering::SeqCst)
    }

    pub fn arg(&self) -> usize {
        self.arg.load(Ordering::SeqCst)
    }

    pub fn fingerprint(&self) -> isize {
        self.routine_id.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Refills identity and routine fields of a claimed record. The state is
    /// set by the caller under the state mutex.
    pub(crate) fn reset(&self, id_slot: *mut ThreadId, routine: usize, arg: usize, caller: usize) {
        self.tid.store(0, Ordering::SeqCst);
        self.ktid.store(0, Ordering::SeqCst);
        self.id_slot.store(id_slot, Ordering::SeqCst);
        self.detached.store(false, Ordering::SeqCst);
        self.start.store(routine, Ordering::SeqCst);
        self.arg.store(arg, Ordering::SeqCst);
        self.routine_id
            .store(routine.wrapping_sub(caller) as isize, Ordering::SeqCst);
        self.go.set(0);
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("tid", &self.tid())
            .field("state", &self.state())
            .field("detached", &self.is_detached())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Handed out by `acquire`, not yet registered.
    Claimed,
    Active,
    Free,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    next: Option<u32>,
    prev: Option<u32>,
    on: Membership,
}

/// Arena plus the two chains. Only reachable through the list mutex.
pub struct Lists {
    records: Vec<&'static ThreadRecord>,
    links: Vec<Link>,
    active: Option<u32>,
    free: Option<u32>,
    active_len: usize,
    free_len: usize,
}

impl Lists {
    const fn new() -> Self {
        Self {
            records: Vec::new(),
            links: Vec::new(),
            active: None,
            free: None,
            active_len: 0,
            free_len: 0,
        }
    }

    fn claim(&mut self) -> &'static ThreadRecord {
        if let Some(idx) = self.free {
            let link = &mut self.links[idx as usize];
            self.free = link.next;
            link.next = None;
            link.prev = None;
            link.on = Membership::Claimed;
            self.free_len -= 1;
            return self.records[idx as usize];
        }

        let idx = self.records.len() as u32;
        let record: &'static ThreadRecord = Box::leak(Box::new(ThreadRecord::new(RecordId(idx))));
        self.records.push(record);
        self.links.push(Link {
            next: None,
            prev: None,
            on: Membership::Claimed,
        });
        record
    }

    fn push_active(&mut self, id: RecordId) {
        let idx = id.0;
        bug_on!(self.links[idx as usize].on != Membership::Claimed);

        let old_head = self.active;
        if let Some(h) = old_head {
            self.links[h as usize].prev = Some(idx);
        }
        self.links[idx as usize] = Link {
            next: old_head,
            prev: None,
            on: Membership::Active,
        };
        self.active = Some(idx);
        self.active_len += 1;
    }

    fn unlink_active(&mut self, idx: u32) {
        let Link { next, prev, .. } = self.links[idx as usize];
        match prev {
            Some(p) => self.links[p as usize].next = next,
            None => self.active = next,
        }
        if let Some(n) = next {
            self.links[n as usize].prev = prev;
        }
        self.active_len -= 1;
    }

    fn push_free(&mut self, idx: u32) {
        self.links[idx as usize] = Link {
            next: self.free,
            prev: None,
            on: Membership::Free,
        };
        self.free = Some(idx);
        self.free_len += 1;
    }

    /// Moves a record onto the free chain. Retiring a record that is already
    /// free is reported and ignored.
    pub fn retire(&mut self, id: RecordId) -> bool {
        let idx = id.0;
        match self.links[idx as usize].on {
            Membership::Active => {
                self.unlink_active(idx);
                self.push_free(idx);
                true
            }
            Membership::Claimed => {
                self.push_free(idx);
                true
            }
            Membership::Free => {
                pr_err!("record {} retired twice", id);
                false
            }
        }
    }

    /// Pushes a claimed record onto the active chain after retiring any stale
    /// active record carrying the same thread id. Returns how many stale
    /// records were retired.
    pub fn register(&mut self, record: &'static ThreadRecord) -> usize {
        let tid = record.tid();
        let mut stale = 0;
        while let Some(old) = self.find_active(tid) {
            pr_debug!("tid {:#x} reused, retiring stale record {}", tid, old.id());
            self.retire(old.id());
            stale += 1;
        }
        self.push_active(record.id());
        stale
    }

    pub fn membership(&self, id: RecordId) -> Membership {
        self.links[id.0 as usize].on
    }

    pub fn first(&self) -> Option<&'static ThreadRecord> {
        self.active.map(|idx| self.records[idx as usize])
    }

    /// Active successor of `id`. Read it before retiring `id`.
    pub fn next_of(&self, id: RecordId) -> Option<&'static ThreadRecord> {
        self.links[id.0 as usize]
            .next
            .map(|idx| self.records[idx as usize])
    }

    pub fn iter(&self) -> ActiveIter<'_> {
        ActiveIter {
            lists: self,
            cursor: self.active,
        }
    }

    pub fn find_active(&self, tid: ThreadId) -> Option<&'static ThreadRecord> {
        self.iter().find(|r| r.tid() == tid)
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    pub fn free_len(&self) -> usize {
        self.free_len
    }
}

pub struct ActiveIter<'a> {
    lists: &'a Lists,
    cursor: Option<u32>,
}

impl Iterator for ActiveIter<'_> {
    type Item = &'static ThreadRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        self.cursor = self.lists.links[idx as usize].next;
        Some(self.lists.records[idx as usize])
    }
}

/// Point-in-time view of one active record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub record: RecordId,
    pub tid: ThreadId,
    pub state: ThreadState,
    pub detached: bool,
    pub fingerprint: isize,
}

/// The registry of one coordinator.
pub struct Registry {
    lists: Locked<Lists>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            lists: Locked::new(Lists::new()),
        }
    }

    pub(crate) fn lock(&self) -> LockedGuard<'_, Lists> {
        self.lists.lock()
    }

    /// Pops a pooled record or allocates a fresh one.
    pub fn acquire(&self) -> &'static ThreadRecord {
        self.lists.lock().claim()
    }

    /// See [`Lists::register`].
    pub fn register(&self, record: &'static ThreadRecord) -> usize {
        self.lists.lock().register(record)
    }

    pub fn retire(&self, record: &ThreadRecord) -> bool {
        self.lists.lock().retire(record.id())
    }

    pub fn find(&self, tid: ThreadId) -> Option<&'static ThreadRecord> {
        self.lists.lock().find_active(tid)
    }

    pub fn membership(&self, record: &ThreadRecord) -> Membership {
        self.lists.lock().membership(record.id())
    }

    pub fn is_active(&self, record: &ThreadRecord) -> bool {
        self.membership(record) == Membership::Active
    }

    pub fn is_free(&self, record: &ThreadRecord) -> bool {
        self.membership(record) == Membership::Free
    }

    /// `(active, free)` chain lengths.
    pub fn lens(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.active_len(), lists.free_len())
    }

    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        let lists = self.lists.lock();
        lists
            .iter()
            .map(|r| ThreadSnapshot {
                record: r.id(),
                tid: r.tid(),
                state: r.state(),
                detached: r.is_detached(),
                fingerprint: r.fingerprint(),
            })
            .collect()
    }
}
