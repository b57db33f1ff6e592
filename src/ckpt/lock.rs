//! Futex-backed synchronization primitives.
//!
//! Everything here is safe to use from a signal handler: no allocation, no
//! pthread objects, only atomics and the futex syscall. Failures of the
//! underlying syscalls are invariant violations and abort the process.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::{bug_on, pr_debug};

#[derive(Debug)]
#[repr(C)]
pub struct Futex {
    pub raw: AtomicI32,
}

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}

impl Futex {
    pub const fn new() -> Self {
        Self {
            raw: AtomicI32::new(0),
        }
    }

    pub fn get(&self) -> u32 {
        self.raw.load(Ordering::SeqCst) as u32
    }

    pub fn set(&self, v: u32) {
        self.raw.store(v as i32, Ordering::SeqCst);
    }

    pub fn set_and_wake(&self, v: u32) {
        self.set(v);
        self.wake();
    }

    pub fn wake(&self) {
        self.wake_n(i32::MAX);
    }

    pub fn wake_n(&self, n: i32) {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        bug_on!(ret < 0);
    }

    pub fn inc(&self) {
        self.raw.fetch_add(1, Ordering::SeqCst);
    }

    fn sys_futex_wait(&self, expected: u32, timeout: Option<&libc::timespec>) -> i32 {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected as i32,
                timeout.map_or(std::ptr::null(), |t| t as *const _),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            -unsafe { *libc::__errno_location() }
        } else {
            ret as i32
        }
    }

    /// Sleeps once while the word still reads `expected`.
    ///
    /// Spurious wakeups, interrupts and a changed value all just return; the
    /// caller re-checks its condition.
    pub fn wait(&self, expected: u32) {
        let ret = self.sys_futex_wait(expected, None);
        bug_on!(ret < 0 && ret != -libc::EINTR && ret != -libc::EWOULDBLOCK);
    }

    /// Waits for the word to read `v`, re-arming a long timeout so a lost
    /// wakeup can't hang the caller for good.
    pub fn wait_until(&self, v: u32) {
        let timeout = libc::timespec {
            tv_sec: 120,
            tv_nsec: 0,
        };
        loop {
            let tmp = self.get();
            if tmp == v {
                break;
            }
            let ret = self.sys_futex_wait(tmp, Some(&timeout));
            if ret == -libc::ETIMEDOUT || ret == -libc::EINTR || ret == -libc::EWOULDBLOCK {
                continue;
            }
            bug_on!(ret < 0);
        }
    }

    pub fn wait_while_eq(&self, v: u32) {
        while self.get() == v {
            self.wait(v);
        }
    }
}

/// A three-state futex mutex: 0 free, 1 held, >1 held with waiters.
#[repr(C)]
pub struct Mutex {
    pub raw: AtomicI32,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            raw: AtomicI32::new(0),
        }
    }

    pub fn lock(&self) {
        loop {
            let c = self.raw.fetch_add(1, Ordering::SeqCst) + 1;
            if c == 1 {
                break;
            }
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.raw as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    c,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                )
            };
            if ret == -1 {
                let errno = unsafe { *libc::__errno_location() };
                bug_on!(errno != libc::EWOULDBLOCK && errno != libc::EINTR);
            }
        }
    }

    pub fn unlock(&self) {
        self.raw.store(0, Ordering::SeqCst);
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        bug_on!(ret == -1);
    }
}

/// Data guarded by a [`Mutex`].
pub struct Locked<T> {
    lock: Mutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: Mutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> LockedGuard<'_, T> {
        self.lock.lock();
        LockedGuard { owner: self }
    }
}

pub struct LockedGuard<'a, T> {
    owner: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for LockedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.unlock();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemaphoreStats {
    pub posts: u64,
    pub waits: u64,
}

/// Counting semaphore. Posts and completed waits are counted for
/// instrumentation.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Futex,
    posts: AtomicU64,
    waits: AtomicU64,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: Futex::new(),
            posts: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    pub fn post(&self) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.count.inc();
        self.count.wake_n(1);
    }

    pub fn try_wait(&self) -> bool {
        let mut v = self.count.raw.load(Ordering::SeqCst);
        while v > 0 {
            match self
                .count
                .raw
                .compare_exchange(v, v - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.waits.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err(cur) => v = cur,
            }
        }
        false
    }

    pub fn wait(&self) {
        while !self.try_wait() {
            self.count.wait(0);
        }
    }

    pub fn value(&self) -> u32 {
        self.count.get()
    }

    pub fn stats(&self) -> SemaphoreStats {
        SemaphoreStats {
            posts: self.posts.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
        }
    }
}

const GATE_WRITER: i32 = 0x4000_0000;
const GATE_READERS: i32 = GATE_WRITER - 1;

/// A reader-writer lock used as a broadcast barrier.
///
/// The coordinator holds it exclusively while threads are suspended; each
/// suspended thread announces itself as a reader with [`enter`] (which never
/// blocks) and then waits in [`wait_open`]. A single `write_unlock` releases
/// every waiter. Readers keep counting until they [`leave`], so [`reinit`]
/// can wait for the stragglers of the previous round.
///
/// [`enter`]: ResumeGate::enter
/// [`wait_open`]: ResumeGate::wait_open
/// [`leave`]: ResumeGate::leave
/// [`reinit`]: ResumeGate::reinit
#[derive(Debug, Default)]
pub struct ResumeGate {
    word: Futex,
}

impl ResumeGate {
    pub const fn new() -> Self {
        Self { word: Futex::new() }
    }

    /// Brings the gate back to its pristine, unheld state.
    ///
    /// Readers left over from the previous round are drained first; reinit
    /// while the gate is held exclusively is a bug.
    pub fn reinit(&self) {
        bug_on!(self.is_closed());
        let stragglers = self.readers();
        if stragglers != 0 {
            pr_debug!("resume gate: waiting for {} readers to leave", stragglers);
        }
        self.wait_drained();
        self.word.set(0);
    }

    pub fn write_lock(&self) {
        loop {
            match self
                .word
                .raw
                .compare_exchange(0, GATE_WRITER, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(cur) => self.word.wait(cur as u32),
            }
        }
    }

    pub fn write_unlock(&self) {
        let prev = self.word.raw.fetch_and(!GATE_WRITER, Ordering::SeqCst);
        bug_on!(prev & GATE_WRITER == 0);
        self.word.wake();
    }

    /// Counts the caller as a reader without waiting for the writer.
    pub fn enter(&self) {
        let prev = self.word.raw.fetch_add(1, Ordering::SeqCst);
        bug_on!(prev & GATE_READERS == GATE_READERS);
    }

    pub fn leave(&self) {
        let prev = self.word.raw.fetch_sub(1, Ordering::SeqCst);
        bug_on!(prev & GATE_READERS == 0);
        if prev & GATE_READERS == 1 {
            self.word.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.word.raw.load(Ordering::SeqCst) & GATE_WRITER != 0
    }

    pub fn readers(&self) -> u32 {
        (self.word.raw.load(Ordering::SeqCst) & GATE_READERS) as u32
    }

    /// Blocks until every reader has left.
    pub fn wait_drained(&self) {
        loop {
            let v = self.word.raw.load(Ordering::SeqCst);
            if v & GATE_READERS == 0 {
                return;
            }
            self.word.wait(v as u32);
        }
    }

    /// Blocks until nobody holds the gate exclusively.
    pub fn wait_open(&self) {
        loop {
            let v = self.word.raw.load(Ordering::SeqCst);
            if v & GATE_WRITER == 0 {
                return;
            }
            self.word.wait(v as u32);
        }
    }
}
