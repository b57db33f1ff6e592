//! Raw libc entry points for execution-context capture.
//!
//! Declared here rather than taken from the `libc` crate so the exact
//! symbols the workspace depends on are visible in one place.

use libc::{c_int, ucontext_t};

extern "C" {
    /// Saves the calling thread's registers, signal mask and floating-point
    /// environment into `ucp`. Returns 0 on success.
    ///
    /// Returns a second time (again with 0) when `setcontext` is later called
    /// on the same `ucp`.
    pub fn getcontext(ucp: *mut ucontext_t) -> c_int;

    /// Restores the context saved in `ucp`. Only returns on failure.
    pub fn setcontext(ucp: *const ucontext_t) -> c_int;
}
