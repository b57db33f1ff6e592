//! Restore round trip.
//!
//! A real image rewrites all of process memory. Here the loader only rewrites
//! the coordinator's own stack, from a copy taken while the checkpoint was
//! frozen, which is exactly what the coordinator needs to land back inside its
//! `checkpoint()` call. Workers keep their memory and are revived from the
//! contexts they saved when the restore froze them.

mod common;

use common::{isolated_coordinator, wait_until, worker_states, Workers};
use freezeframe::ckpt::ThreadState;
use freezeframe::{CheckpointImage, CkptError, Coordinator, FrozenProcess, Outcome};
use std::hint::black_box;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WORKERS: u64 = 3;
const STACK_COPY_MAX: usize = 1 << 20;
const DEEP_PAD: usize = 512 * 1024;

static PASSES: AtomicUsize = AtomicUsize::new(0);
static CHECKPOINTED: AtomicUsize = AtomicUsize::new(0);
static RESTORED: AtomicUsize = AtomicUsize::new(0);

/// Copy of the coordinator stack between the image writer and `top`.
struct StackImage {
    buf: Vec<u8>,
    top: usize,
    base: usize,
    len: usize,
}

impl StackImage {
    fn new(top: usize) -> Self {
        Self {
            buf: vec![0; STACK_COPY_MAX],
            top,
            base: 0,
            len: 0,
        }
    }
}

fn image_err(reason: &str) -> CkptError {
    CkptError::Image {
        reason: reason.to_string(),
    }
}

impl CheckpointImage for StackImage {
    #[inline(never)]
    fn save(&mut self, _frozen: &FrozenProcess) -> freezeframe::Result<()> {
        let marker = 0u8;
        let low = black_box(ptr::addr_of!(marker)) as usize;
        let len = self.top - low;
        if len > self.buf.len() {
            return Err(image_err("stack copy too large"));
        }
        unsafe { ptr::copy_nonoverlapping(low as *const u8, self.buf.as_mut_ptr(), len) };
        self.base = low;
        self.len = len;
        Ok(())
    }

    #[inline(never)]
    fn load(&mut self, _frozen: &FrozenProcess) -> freezeframe::Result<()> {
        let marker = 0u8;
        let here = black_box(ptr::addr_of!(marker)) as usize;
        if self.len == 0 || here + 64 * 1024 > self.base {
            return Err(image_err("loader runs inside the region it restores"));
        }
        unsafe { ptr::copy_nonoverlapping(self.buf.as_ptr(), self.base as *mut u8, self.len) };
        Ok(())
    }
}

#[inline(never)]
fn checkpoint_once(coord: &'static Coordinator, image: &mut StackImage) {
    match coord.checkpoint(image) {
        Ok(Outcome::Checkpointed) => CHECKPOINTED.fetch_add(1, Ordering::SeqCst),
        Ok(Outcome::Restored) => RESTORED.fetch_add(1, Ordering::SeqCst),
        Err(e) => panic!("checkpoint failed: {}", e),
    };
}

/// Restores from well below the frames the image is about to overwrite.
#[inline(never)]
fn deep_restore(coord: &'static Coordinator, image: &mut StackImage) -> CkptError {
    let mut pad = [0u8; DEEP_PAD];
    black_box(&mut pad);
    match coord.restore(image) {
        Err(e) => e,
        Ok(never) => match never {},
    }
}

#[test]
fn test_restore_revives_every_thread() {
    let anchor = 0u8;
    let top = black_box(ptr::addr_of!(anchor)) as usize;

    let coord = isolated_coordinator();
    let workers = Workers::spawn(coord, WORKERS as usize);
    let image: &'static mut StackImage = Box::leak(Box::new(StackImage::new(top)));

    checkpoint_once(coord, image);

    // Reached twice: after the checkpoint, and again once the restore jumped
    // back into it.
    if PASSES.fetch_add(1, Ordering::SeqCst) == 0 {
        assert_eq!(CHECKPOINTED.load(Ordering::SeqCst), 1);
        let err = deep_restore(coord, image);
        panic!("restore returned: {}", err);
    }

    assert_eq!(CHECKPOINTED.load(Ordering::SeqCst), 1);
    assert_eq!(RESTORED.load(Ordering::SeqCst), 1);

    let stats = coord.stats();
    assert_eq!(stats.expected, WORKERS as usize);
    assert_eq!(stats.rounds, 2);
    // checkpoint round, restore round, restore completion barrier
    assert_eq!(stats.arrivals.posts, 3 * WORKERS);
    assert_eq!(stats.arrivals.waits, 3 * WORKERS);
    assert_eq!(stats.releases.posts, WORKERS);
    assert!(wait_until(Duration::from_secs(5), || {
        coord.stats().releases.waits == WORKERS
    }));

    assert_eq!(
        worker_states(coord),
        vec![ThreadState::Running; WORKERS as usize]
    );
    let now = workers.snapshot();
    assert!(workers.all_progress_since(&now));

    workers.stop_and_join();
    coord.teardown().unwrap();
}
