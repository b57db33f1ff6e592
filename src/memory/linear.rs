//! A linear allocator over anonymous mappings.
//!
//! Objects are laid out one after another in a plain buffer, each behind a
//! small size header. Only the last object can be released (popped) or grown
//! in place; anything else stays put until the allocator is dropped. When a
//! chunk runs out a new one is mapped and the old one is simply left behind,
//! still holding its live objects.

use std::ptr;

use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use super::{AllocFlags, Allocator};
use crate::ckpt::lock::Locked;
use crate::pr_err;

const ALIGN: usize = 16;
/// Per-object header holding the object's rounded size.
const HDR: usize = ALIGN;
/// Per-chunk header: link to the previous chunk and the mapping length.
const CHUNK_HDR: usize = ALIGN;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(v: usize, to: usize) -> Option<usize> {
    Some(v.checked_add(to - 1)? & !(to - 1))
}

fn grow_size(need: usize) -> Option<usize> {
    let page = page_size();
    let batch = 2 * page;
    let need = round_up(need.checked_add(CHUNK_HDR)?, page)?;
    Some(need.max(batch))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinearStats {
    /// Bytes mapped, chunk headers included.
    pub mapped: usize,
    pub chunks: usize,
    /// Live objects and the bytes they cover (headers excluded).
    pub objects: usize,
    pub in_use: usize,
    /// Frees of objects other than the last one; their space is lost.
    pub stranded: usize,
}

struct LinearState {
    free_mem: *mut u8,
    free_bytes: usize,
    /// User pointer of the most recent allocation, null once popped.
    last: *mut u8,
    /// Newest chunk; each chunk header points at the previous one.
    chunk: *mut u8,
    stats: LinearStats,
}

// SAFETY: The pointers are only accessed through the owning lock
unsafe impl Send for LinearState {}

impl LinearState {
    const fn new() -> Self {
        Self {
            free_mem: ptr::null_mut(),
            free_bytes: 0,
            last: ptr::null_mut(),
            chunk: ptr::null_mut(),
            stats: LinearStats {
                mapped: 0,
                chunks: 0,
                objects: 0,
                in_use: 0,
                stranded: 0,
            },
        }
    }

    fn grow(&mut self, need: usize) -> bool {
        let Some(size) = grow_size(need) else {
            return false;
        };
        let aux = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if aux == MAP_FAILED {
            pr_err!("linear allocator: can't map {} bytes", size);
            return false;
        }

        let base = aux as *mut u8;
        unsafe {
            (base as *mut *mut u8).write(self.chunk);
            (base.add(std::mem::size_of::<*mut u8>()) as *mut usize).write(size);
        }
        self.chunk = base;
        // The rest of the old chunk is abandoned.
        self.free_mem = unsafe { base.add(CHUNK_HDR) };
        self.free_bytes = size - CHUNK_HDR;
        self.last = ptr::null_mut();
        self.stats.mapped += size;
        self.stats.chunks += 1;
        true
    }

    fn alloc(&mut self, size: usize, flags: AllocFlags) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(rounded) = round_up(size, ALIGN) else {
            return ptr::null_mut();
        };
        let Some(need) = rounded.checked_add(HDR) else {
            return ptr::null_mut();
        };
        if self.free_bytes < need && !self.grow(need) {
            return ptr::null_mut();
        }

        let block = self.free_mem;
        let user = unsafe {
            (block as *mut usize).write(rounded);
            block.add(HDR)
        };
        self.free_mem = unsafe { self.free_mem.add(need) };
        self.free_bytes -= need;
        self.last = user;
        self.stats.objects += 1;
        self.stats.in_use += rounded;

        // A popped object may have left dirty bytes behind.
        if flags.contains(AllocFlags::ZERO_INIT) {
            unsafe { ptr::write_bytes(user, 0, rounded) };
        }
        user
    }

    fn size_of(user: *mut u8) -> usize {
        unsafe { (user.sub(HDR) as *const usize).read() }
    }

    fn free(&mut self, user: *mut u8) {
        if user.is_null() {
            return;
        }
        let size = Self::size_of(user);
        self.stats.objects -= 1;
        self.stats.in_use -= size;

        if user == self.last {
            self.free_mem = unsafe { user.sub(HDR) };
            self.free_bytes += size + HDR;
            self.last = ptr::null_mut(); // next free of an older object strands it
        } else {
            self.stats.stranded += 1;
        }
    }

    fn realloc(&mut self, user: *mut u8, size: usize, flags: AllocFlags) -> *mut u8 {
        if user.is_null() {
            return self.alloc(size, flags);
        }
        if size == 0 {
            self.free(user);
            return ptr::null_mut();
        }

        let old = Self::size_of(user);
        let Some(rounded) = round_up(size, ALIGN) else {
            return ptr::null_mut();
        };
        if rounded <= old && user != self.last {
            return user;
        }

        if user == self.last {
            let avail = old + self.free_bytes;
            if rounded <= avail {
                unsafe { (user.sub(HDR) as *mut usize).write(rounded) };
                self.free_mem = unsafe { user.add(rounded) };
                self.free_bytes = avail - rounded;
                self.stats.in_use = self.stats.in_use - old + rounded;
                if flags.contains(AllocFlags::ZERO_INIT) && rounded > old {
                    unsafe { ptr::write_bytes(user.add(old), 0, rounded - old) };
                }
                return user;
            }
        }

        let fresh = self.alloc(size, flags);
        if fresh.is_null() {
            return fresh;
        }
        unsafe { ptr::copy_nonoverlapping(user, fresh, old.min(rounded)) };
        // The old object is no longer last; it gets stranded.
        self.free(user);
        fresh
    }

    fn unmap_all(&mut self) {
        let mut chunk = self.chunk;
        while !chunk.is_null() {
            let (prev, size) = unsafe {
                (
                    (chunk as *const *mut u8).read(),
                    (chunk.add(std::mem::size_of::<*mut u8>()) as *const usize).read(),
                )
            };
            unsafe { munmap(chunk as *mut c_void, size) };
            chunk = prev;
        }
        *self = Self::new();
    }
}

/// Linear allocator usable as the façade's collaborator. Chunks are always
/// mapped read-write; `WRITE` is accepted and otherwise ignored.
pub struct LinearAllocator {
    state: Locked<LinearState>,
}

impl Default for LinearAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearAllocator {
    pub const fn new() -> Self {
        Self {
            state: Locked::new(LinearState::new()),
        }
    }

    pub fn stats(&self) -> LinearStats {
        self.state.lock().stats
    }

    /// Word-aligned by construction; exposed for callers that need to check.
    pub fn align() -> usize {
        ALIGN
    }
}

impl Allocator for LinearAllocator {
    fn allocate(&self, size: usize, flags: AllocFlags) -> *mut u8 {
        self.state.lock().alloc(size, flags)
    }

    fn reallocate(&self, ptr: *mut u8, size: usize, flags: AllocFlags) -> *mut u8 {
        self.state.lock().realloc(ptr, size, flags)
    }

    fn deallocate(&self, ptr: *mut u8) {
        self.state.lock().free(ptr)
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        self.state.lock().unmap_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_basic() {
        let a = LinearAllocator::new();
        let ptr1 = a.allocate(64, AllocFlags::WRITE);
        assert!(!ptr1.is_null());

        let ptr2 = a.allocate(128, AllocFlags::WRITE);
        assert!(!ptr2.is_null());
        assert!(ptr2 > ptr1);

        let stats = a.stats();
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.in_use, 192);
        assert_eq!(stats.chunks, 1);
    }

    #[test]
    fn test_zero_size_is_null() {
        let a = LinearAllocator::new();
        assert!(a.allocate(0, AllocFlags::WRITE).is_null());
        assert_eq!(a.stats().chunks, 0);
    }

    #[test]
    fn test_free_last_reuses_space() {
        let a = LinearAllocator::new();
        let ptr1 = a.allocate(64, AllocFlags::WRITE);
        let ptr2 = a.allocate(128, AllocFlags::WRITE);
        assert!(!ptr1.is_null());

        unsafe { ptr::write_bytes(ptr2, 0xAB, 128) };
        a.deallocate(ptr2);

        let ptr3 = a.allocate(64, AllocFlags::WRITE | AllocFlags::ZERO_INIT);
        assert_eq!(ptr3, ptr2);
        let bytes = unsafe { std::slice::from_raw_parts(ptr3, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(a.stats().stranded, 0);
    }

    #[test]
    fn test_free_older_object_is_stranded() {
        let a = LinearAllocator::new();
        let ptr1 = a.allocate(32, AllocFlags::WRITE);
        let _ptr2 = a.allocate(32, AllocFlags::WRITE);
        a.deallocate(ptr1);
        let stats = a.stats();
        assert_eq!(stats.stranded, 1);
        assert_eq!(stats.objects, 1);
        a.deallocate(ptr::null_mut());
    }

    #[test]
    fn test_realloc_grows_last_in_place() {
        let a = LinearAllocator::new();
        let ptr1 = a.allocate(16, AllocFlags::WRITE);
        unsafe { ptr::write_bytes(ptr1, 7, 16) };
        let grown = a.reallocate(ptr1, 256, AllocFlags::WRITE);
        assert_eq!(grown, ptr1);
        assert_eq!(unsafe { *grown.add(15) }, 7);
        assert_eq!(a.stats().in_use, 256);
    }

    #[test]
    fn test_realloc_moves_older_object() {
        let a = LinearAllocator::new();
        let ptr1 = a.allocate(16, AllocFlags::WRITE);
        unsafe { ptr::write_bytes(ptr1, 9, 16) };
        let _ptr2 = a.allocate(16, AllocFlags::WRITE);

        let moved = a.reallocate(ptr1, 64, AllocFlags::WRITE);
        assert_ne!(moved, ptr1);
        let bytes = unsafe { std::slice::from_raw_parts(moved, 16) };
        assert!(bytes.iter().all(|&b| b == 9));
        assert!(a.reallocate(moved, 0, AllocFlags::WRITE).is_null());
    }

    #[test]
    fn test_large_allocation_maps_new_chunk() {
        let a = LinearAllocator::new();
        let small = a.allocate(8, AllocFlags::WRITE);
        assert!(!small.is_null());

        let large_size = page_size() * 3;
        let large = a.allocate(large_size, AllocFlags::WRITE);
        assert!(!large.is_null());
        unsafe { ptr::write_bytes(large, 1, large_size) };

        let stats = a.stats();
        assert_eq!(stats.chunks, 2);
        assert!(stats.mapped >= large_size + 2 * page_size());
    }

    #[test]
    fn test_alignment() {
        let a = LinearAllocator::new();
        let _ = a.allocate(7, AllocFlags::WRITE);
        let ptr = a.allocate(8, AllocFlags::WRITE);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % LinearAllocator::align(), 0);
    }
}
