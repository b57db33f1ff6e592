//! Signal-safe logging for the coordination core.
//!
//! The `log` facade (and whatever logger the host installs behind it) may lock
//! or allocate, so it must not run inside the suspend handler or while other
//! threads are frozen holding allocator locks. Messages from those paths go
//! through `pr_*!`: formatted into a fixed stack buffer and written straight to
//! the log fd.

use std::ffi::CString;
use std::fmt::{self, Write as _};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};

pub use log::{Level, LevelFilter};

pub const DEFAULT_LOGFD: RawFd = libc::STDERR_FILENO;

const LINE_MAX: usize = 512;

static LOG_FD: AtomicI32 = AtomicI32::new(DEFAULT_LOGFD);
static LOG_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Off as usize);
static START_NS: AtomicI64 = AtomicI64::new(0);

pub fn log_get_fd() -> RawFd {
    LOG_FD.load(Ordering::Relaxed)
}

pub fn log_level() -> LevelFilter {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn set_log_level(level: LevelFilter) {
    LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn log_enabled(level: Level) -> bool {
    level as usize <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Points the fd logger at `output` and sets its level.
///
/// `None` duplicates stderr, `"-"` duplicates stdout, anything else is opened
/// as a file (truncated, mode 0600).
pub fn log_init(output: Option<&str>, level: LevelFilter) -> io::Result<()> {
    let new_logfd = match output {
        Some("-") => unsafe { libc::dup(libc::STDOUT_FILENO) },
        Some(path) => {
            let c_path = CString::new(path)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY | libc::O_APPEND,
                    0o600,
                )
            }
        }
        None => unsafe { libc::dup(DEFAULT_LOGFD) },
    };

    if new_logfd < 0 {
        let err = io::Error::last_os_error();
        log::error!("Log engine failure, can't create log fd: {}", err);
        return Err(err);
    }

    let old = LOG_FD.swap(new_logfd, Ordering::SeqCst);
    if old > libc::STDERR_FILENO {
        unsafe { libc::close(old) };
    }
    let _ = START_NS.compare_exchange(0, monotonic_ns(), Ordering::SeqCst, Ordering::SeqCst);
    set_log_level(level);
    Ok(())
}

fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

fn gettid() -> libc::c_long {
    unsafe { libc::syscall(libc::SYS_gettid) }
}

/// Fixed-capacity line buffer. Output past the capacity is dropped.
struct LineBuf {
    buf: [u8; LINE_MAX],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            buf: [0; LINE_MAX],
            len: 0,
        }
    }

    fn terminate(&mut self) {
        if self.len == LINE_MAX {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_MAX - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let ret = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if ret < 0 {
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[ret as usize..];
    }
}

fn format_line(line: &mut LineBuf, level: Level, args: fmt::Arguments<'_>) {
    let start = START_NS.load(Ordering::Relaxed);
    let elapsed = if start == 0 { 0 } else { monotonic_ns() - start };
    let _ = write!(
        line,
        "[{:5}.{:06}] {:5} ({}) ",
        elapsed / 1_000_000_000,
        (elapsed % 1_000_000_000) / 1_000,
        level,
        gettid()
    );
    let _ = line.write_fmt(args);
    line.terminate();
}

/// Backend of the `pr_*!` macros. Safe to call from a signal handler as long
/// as the formatted arguments do not allocate.
pub fn print_on_level(level: Level, args: fmt::Arguments<'_>) {
    if !log_enabled(level) {
        return;
    }
    let saved_errno = unsafe { *libc::__errno_location() };
    let mut line = LineBuf::new();
    format_line(&mut line, level, args);
    write_all(log_get_fd(), line.as_bytes());
    unsafe { *libc::__errno_location() = saved_errno };
}

/// Reports a broken invariant and aborts. Never unwinds.
#[cold]
pub fn bug(file: &str, line: u32, what: &str) -> ! {
    let mut buf = LineBuf::new();
    let _ = write!(buf, "BUG at {}:{}: {}", file, line, what);
    buf.terminate();
    write_all(log_get_fd(), buf.as_bytes());
    if log_get_fd() != libc::STDERR_FILENO {
        write_all(libc::STDERR_FILENO, buf.as_bytes());
    }
    unsafe { libc::abort() }
}

#[macro_export]
macro_rules! pr_err {
    ($($arg:tt)*) => {
        $crate::ckpt::log::print_on_level($crate::ckpt::log::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)*) => {
        $crate::ckpt::log::print_on_level($crate::ckpt::log::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)*) => {
        $crate::ckpt::log::print_on_level($crate::ckpt::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_debug {
    ($($arg:tt)*) => {
        $crate::ckpt::log::print_on_level($crate::ckpt::log::Level::Debug, format_args!($($arg)*))
    };
}

/// Aborts with a `BUG at file:line` report when the condition holds.
#[macro_export]
macro_rules! bug_on {
    ($cond:expr) => {
        if $cond {
            $crate::ckpt::log::bug(file!(), line!(), stringify!($cond))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(level: Level, args: fmt::Arguments<'_>) -> String {
        let mut line = LineBuf::new();
        format_line(&mut line, level, args);
        String::from_utf8(line.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_line_format() {
        let s = render(Level::Warn, format_args!("rescan {} pending", 2));
        assert!(s.starts_with('['));
        assert!(s.contains("] WARN  ("));
        assert!(s.ends_with(") rescan 2 pending\n"));
    }

    #[test]
    fn test_long_line_truncated() {
        let long = "x".repeat(LINE_MAX * 2);
        let s = render(Level::Error, format_args!("{}", long));
        assert_eq!(s.len(), LINE_MAX);
        assert!(s.ends_with("x\n"));
    }

    #[test]
    fn test_log_init_to_file() {
        let path = std::env::temp_dir().join(format!("freezeframe-log-{}.log", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();

        log_init(Some(&path_str), LevelFilter::Info).unwrap();
        crate::pr_info!("round {} done", 7);
        crate::pr_debug!("filtered out");
        log_init(None, LevelFilter::Off).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(contents.contains("round 7 done"));
        assert!(!contents.contains("filtered out"));
        assert_eq!(log_level(), LevelFilter::Off);
    }

    #[test]
    fn test_log_init_rejects_nul_path() {
        let err = log_init(Some("bad\0path"), LevelFilter::Off).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
