//! Execution-context capture and resume for freezeframe
//!
//! This crate is the only place raw CPU context manipulation happens. A
//! [`ExecutionContext`] is captured with [`save_context!`] (which expands to the
//! capture call inside the caller's own frame) and later re-entered with
//! [`ExecutionContext::resume`], which never returns.
//!
//! Capture returns twice: once normally, and once more every time the context is
//! resumed. Code between the capture and the point where the two paths diverge
//! must keep its state in memory that outlives the frame (statics, thread-locals,
//! heap records), never in locals.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
extern crate std;

pub mod raw;

mod context;

pub use context::ExecutionContext;

/// Captures the calling frame into an [`ExecutionContext`].
///
/// Evaluates to the `c_int` returned by `getcontext` (0 on success, -1 on
/// failure). The capture runs in the frame that expands the macro, so resuming
/// the context lands right after the expansion site.
///
/// # Safety
///
/// Must be expanded inside an `unsafe` block. The enclosing frame must still be
/// live whenever the context is resumed.
#[macro_export]
macro_rules! save_context {
    ($ctx:expr) => {
        $crate::raw::getcontext($crate::ExecutionContext::as_mut_ptr($ctx))
    };
}
