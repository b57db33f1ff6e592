//! Allocator collaborator and the four standard allocation entry points
//! routed into it.

pub mod linear;

use bitflags::bitflags;

use crate::pr_debug;

pub use linear::LinearAllocator;

bitflags! {
    /// What the caller intends to do with an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        const WRITE = 1 << 0;
        const ZERO_INIT = 1 << 1;
    }
}

/// The opaque allocator behind the façade. Pointers are raw and untyped, the
/// way the C entry points hand them around.
pub trait Allocator {
    /// Returns null on failure or when `size` is zero.
    fn allocate(&self, size: usize, flags: AllocFlags) -> *mut u8;

    /// `ptr` null behaves like `allocate`, `size` zero like `deallocate`.
    fn reallocate(&self, ptr: *mut u8, size: usize, flags: AllocFlags) -> *mut u8;

    /// Null is ignored.
    fn deallocate(&self, ptr: *mut u8);
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn allocate(&self, size: usize, flags: AllocFlags) -> *mut u8 {
        (**self).allocate(size, flags)
    }

    fn reallocate(&self, ptr: *mut u8, size: usize, flags: AllocFlags) -> *mut u8 {
        (**self).reallocate(ptr, size, flags)
    }

    fn deallocate(&self, ptr: *mut u8) {
        (**self).deallocate(ptr)
    }
}

/// `malloc`/`calloc`/`realloc`/`free` as pass-throughs to an [`Allocator`],
/// with diagnostic logging on the signal-safe channel.
#[derive(Debug, Default)]
pub struct Facade<A> {
    alloc: A,
}

impl<A: Allocator> Facade<A> {
    pub const fn new(alloc: A) -> Self {
        Self { alloc }
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        pr_debug!("malloc call with size {}", size);
        let addr = self.alloc.allocate(size, AllocFlags::WRITE);
        pr_debug!("  returns addr {:p}", addr);
        addr
    }

    /// Null when `nmemb * size` overflows.
    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        pr_debug!("calloc call with nmemb {} size {}", nmemb, size);
        let Some(total) = nmemb.checked_mul(size) else {
            pr_debug!("  size overflow");
            return std::ptr::null_mut();
        };
        let addr = self
            .alloc
            .allocate(total, AllocFlags::WRITE | AllocFlags::ZERO_INIT);
        pr_debug!("  returns addr {:p}", addr);
        addr
    }

    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        pr_debug!("realloc call with ptr {:p} and size {}", ptr, size);
        let addr = self.alloc.reallocate(ptr, size, AllocFlags::WRITE);
        pr_debug!("  returns addr {:p}", addr);
        addr
    }

    pub fn free(&self, ptr: *mut u8) {
        pr_debug!("free call with ptr {:p}", ptr);
        self.alloc.deallocate(ptr)
    }
}
