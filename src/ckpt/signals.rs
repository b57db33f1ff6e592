//! Suspend-signal plumbing: handler installation, targeted delivery,
//! liveness probes and signal-mask guards.

use std::sync::atomic::{AtomicU64, Ordering};

use super::lock::Mutex;
use super::registry::ThreadId;
use crate::error::{CkptError, Result};

/// Bit `n - 1` set once our handler owns signal `n`.
static INSTALLED: AtomicU64 = AtomicU64::new(0);
static INSTALL_LOCK: Mutex = Mutex::new();

fn signal_bit(sig: libc::c_int) -> u64 {
    1u64 << ((sig - 1) as u32 & 63)
}

pub fn is_installed(sig: libc::c_int) -> bool {
    INSTALLED.load(Ordering::SeqCst) & signal_bit(sig) != 0
}

/// Installs the suspend handler for `sig`. Idempotent; the first call wins and
/// any handler that was there before is replaced for good.
pub fn install(sig: libc::c_int) -> Result<()> {
    if is_installed(sig) {
        return Ok(());
    }

    INSTALL_LOCK.lock();
    let ret = install_locked(sig);
    INSTALL_LOCK.unlock();
    ret
}

fn install_locked(sig: libc::c_int) -> Result<()> {
    if is_installed(sig) {
        return Ok(());
    }

    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };

    act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    act.sa_sigaction = on_suspend_signal as usize;
    unsafe { libc::sigemptyset(&mut act.sa_mask) };

    let ret = unsafe { libc::sigaction(sig, &act, &mut old) };
    if ret < 0 {
        let source = std::io::Error::last_os_error();
        log::error!("sigaction({}) failed: {}", sig, source);
        return Err(CkptError::Signal {
            signal: sig,
            source,
        });
    }

    if old.sa_sigaction != libc::SIG_DFL && old.sa_sigaction != libc::SIG_IGN {
        log::warn!("signal {}: replacing a foreign handler", sig);
    }
    log::debug!("suspend handler installed on signal {}", sig);

    INSTALLED.fetch_or(signal_bit(sig), Ordering::SeqCst);
    Ok(())
}

extern "C" fn on_suspend_signal(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _uctx: *mut libc::c_void,
) {
    let errno = unsafe { libc::__errno_location() };
    let saved = unsafe { *errno };
    super::coordinator::handle_suspend_signal(sig);
    unsafe { *errno = saved };
}

/// Sends `sig` to one thread. Returns 0 or the error number.
pub fn send(tid: ThreadId, sig: libc::c_int) -> libc::c_int {
    unsafe { libc::pthread_kill(tid, sig) }
}

/// Kernel thread id of the caller.
pub fn kernel_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Signal-0 check against a kernel thread id of this process. False only when
/// the thread is known to be gone.
pub fn probe(ktid: libc::pid_t) -> bool {
    if ktid <= 0 {
        return false;
    }
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), ktid, 0) };
    !(ret < 0 && unsafe { *libc::__errno_location() } == libc::ESRCH)
}

/// Blocks one signal on the calling thread until dropped.
pub struct BlockedSignal {
    old: libc::sigset_t,
}

impl BlockedSignal {
    pub fn new(sig: libc::c_int) -> Self {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut old: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, sig);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
        }
        Self { old }
    }
}

impl Drop for BlockedSignal {
    fn drop(&mut self) {
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut()) };
    }
}

pub fn is_blocked(sig: libc::c_int) -> bool {
    let mut cur: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut cur);
        libc::sigismember(&cur, sig) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_signal_guard_restores_mask() {
        let sig = libc::SIGUSR2;
        assert!(!is_blocked(sig));
        {
            let _guard = BlockedSignal::new(sig);
            assert!(is_blocked(sig));
            {
                let _inner = BlockedSignal::new(sig);
                assert!(is_blocked(sig));
            }
            assert!(is_blocked(sig));
        }
        assert!(!is_blocked(sig));
    }

    #[test]
    fn test_probe_self_and_dead_thread() {
        assert!(probe(kernel_tid()));
        assert!(!probe(0));

        let ktid = std::thread::spawn(kernel_tid).join().unwrap();
        // the kernel may hand the id out again, but not this fast in practice
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!probe(ktid));
    }

    #[test]
    fn test_send_to_self_with_zero_signal() {
        let me = unsafe { libc::pthread_self() };
        assert_eq!(send(me, 0), 0);
    }
}
