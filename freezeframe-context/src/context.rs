use core::cell::UnsafeCell;
use core::fmt;

use crate::raw;

/// A saved execution point: registers, signal mask and FPU state of one thread.
///
/// Stored in place; never moved or cloned once captured. On x86_64 the saved
/// machine context holds a pointer into the struct itself.
#[repr(C)]
pub struct ExecutionContext {
    raw: UnsafeCell<libc::ucontext_t>,
}

// Written only by the owning thread (capture) and read only by that same thread
// (resume); cross-thread access is limited to diagnostics.
unsafe impl Sync for ExecutionContext {}
unsafe impl Send for ExecutionContext {}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            raw: UnsafeCell::new(unsafe { core::mem::zeroed() }),
        }
    }

    pub fn as_mut_ptr(&self) -> *mut libc::ucontext_t {
        self.raw.get()
    }

    /// Jumps back into the captured execution point.
    ///
    /// # Safety
    ///
    /// The context must have been captured by the calling thread, and the frame
    /// that captured it must still be live.
    pub unsafe fn resume(&self) -> ! {
        raw::setcontext(self.raw.get() as *const libc::ucontext_t);
        // setcontext only returns on failure
        libc::abort()
    }

    /// Saved instruction pointer, zero if never captured.
    #[cfg(target_arch = "x86_64")]
    pub fn instruction_pointer(&self) -> usize {
        unsafe { (*self.raw.get()).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
    }

    /// Saved stack pointer, zero if never captured.
    #[cfg(target_arch = "x86_64")]
    pub fn stack_pointer(&self) -> usize {
        unsafe { (*self.raw.get()).uc_mcontext.gregs[libc::REG_RSP as usize] as usize }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn instruction_pointer(&self) -> usize {
        unsafe { (*self.raw.get()).uc_mcontext.pc as usize }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn stack_pointer(&self) -> usize {
        unsafe { (*self.raw.get()).uc_mcontext.sp as usize }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ip", &format_args!("{:#x}", self.instruction_pointer()))
            .field("sp", &format_args!("{:#x}", self.stack_pointer()))
            .finish()
    }
}
