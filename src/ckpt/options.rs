//! Process-wide checkpoint options.
//!
//! Initialized once at startup (or lazily from the environment), read
//! everywhere.

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use log::LevelFilter;

pub const ENV_SIGNAL: &str = "FREEZEFRAME_SIGNAL";
pub const ENV_RESCAN_US: &str = "FREEZEFRAME_RESCAN_US";
pub const ENV_LOG: &str = "FREEZEFRAME_LOG";
pub const ENV_LOG_FILE: &str = "FREEZEFRAME_LOG_FILE";

/// Pause between two registry scans while some thread has not yet reacted to
/// its suspend signal.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_micros(10);

/// Global options instance.
pub static OPTS: OnceLock<CkptOpts> = OnceLock::new();

/// Initialize the global options. Fails (handing the value back) if they were
/// already set.
pub fn opts_init(opts: CkptOpts) -> Result<(), CkptOpts> {
    OPTS.set(opts)
}

/// Get reference to global options, reading the environment on first use if
/// nobody called [`opts_init`].
pub fn opts() -> &'static CkptOpts {
    OPTS.get_or_init(CkptOpts::from_env)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CkptOpts {
    /// Signal used to stop threads. Must be catchable.
    pub suspend_signal: libc::c_int,
    pub rescan_interval: Duration,
    /// Level of the signal-safe fd logger.
    pub log_level: LevelFilter,
    /// `None` logs to stderr, `"-"` to stdout.
    pub log_file: Option<String>,
}

impl Default for CkptOpts {
    fn default() -> Self {
        Self {
            suspend_signal: libc::SIGUSR1,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            log_level: LevelFilter::Off,
            log_file: None,
        }
    }
}

impl CkptOpts {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds options from a key lookup. Unparseable values are reported and
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();

        if let Some(v) = lookup(ENV_SIGNAL) {
            match v.trim().parse::<libc::c_int>() {
                Ok(sig) if is_usable_signal(sig) => opts.suspend_signal = sig,
                _ => log::warn!("{}: ignoring unusable signal {:?}", ENV_SIGNAL, v),
            }
        }

        if let Some(v) = lookup(ENV_RESCAN_US) {
            match v.trim().parse::<u64>() {
                Ok(us) => opts.rescan_interval = Duration::from_micros(us),
                Err(e) => log::warn!("{}: ignoring {:?}: {}", ENV_RESCAN_US, v, e),
            }
        }

        if let Some(v) = lookup(ENV_LOG) {
            match LevelFilter::from_str(v.trim()) {
                Ok(level) => opts.log_level = level,
                Err(e) => log::warn!("{}: ignoring {:?}: {}", ENV_LOG, v, e),
            }
        }

        opts.log_file = lookup(ENV_LOG_FILE).filter(|v| !v.is_empty());
        opts
    }
}

/// Signals that cannot carry the suspend protocol: uncatchable ones and those
/// the kernel or runtime reserve for faults.
pub fn is_usable_signal(sig: libc::c_int) -> bool {
    if sig <= 0 || sig > libc::SIGRTMAX() {
        return false;
    }
    !matches!(
        sig,
        libc::SIGKILL
            | libc::SIGSTOP
            | libc::SIGSEGV
            | libc::SIGBUS
            | libc::SIGILL
            | libc::SIGFPE
            | libc::SIGABRT
    )
}
