//! Shared helpers for the integration tests.
#![allow(dead_code)]

use freezeframe::ckpt::{CkptOpts, ThreadState, TrackedThread};
use freezeframe::{CheckpointImage, Coordinator, FrozenProcess, Lifecycle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A coordinator of its own, with the calling test thread as coordinator.
pub fn isolated_coordinator() -> &'static Coordinator {
    let lifecycle: &'static Lifecycle = Box::leak(Box::new(Lifecycle::new()));
    Coordinator::create(&CkptOpts::default(), lifecycle).expect("create coordinator")
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Busy workers, each bumping its own counter until stopped.
pub struct Workers {
    pub stop: Arc<AtomicBool>,
    pub counters: Arc<Vec<AtomicU64>>,
    pub handles: Vec<TrackedThread<()>>,
}

impl Workers {
    pub fn spawn(coord: &'static Coordinator, n: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let counters: Arc<Vec<AtomicU64>> = Arc::new((0..n).map(|_| AtomicU64::new(0)).collect());
        let handles = (0..n)
            .map(|i| {
                let stop = Arc::clone(&stop);
                let counters = Arc::clone(&counters);
                coord
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            counters[i].fetch_add(1, Ordering::SeqCst);
                            std::hint::spin_loop();
                        }
                    })
                    .expect("spawn worker")
            })
            .collect();
        let workers = Self {
            stop,
            counters,
            handles,
        };
        assert!(
            wait_until(Duration::from_secs(5), || workers.all_moved()),
            "workers never started"
        );
        workers
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .collect()
    }

    fn all_moved(&self) -> bool {
        self.counters.iter().all(|c| c.load(Ordering::SeqCst) > 0)
    }

    /// Whether every counter moves past `since`.
    pub fn all_progress_since(&self, since: &[u64]) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.counters
                .iter()
                .zip(since)
                .all(|(c, s)| c.load(Ordering::SeqCst) > *s)
        })
    }

    pub fn stop_and_join(self) {
        self.stop.store(true, Ordering::SeqCst);
        for h in self.handles {
            h.join().expect("worker panicked");
        }
    }
}

/// States of every tracked thread except the coordinator.
pub fn worker_states(coord: &Coordinator) -> Vec<ThreadState> {
    coord
        .threads()
        .into_iter()
        .map(|t| t.state)
        .filter(|s| *s != ThreadState::Coordinator)
        .collect()
}

/// Image that checks, while the process is frozen, that no counter moves.
pub struct FreezeProbe {
    pub counters: Arc<Vec<AtomicU64>>,
    pub saves: u64,
    pub drifted: u64,
    pub last: Option<FrozenProcess>,
}

impl FreezeProbe {
    pub fn new(counters: Arc<Vec<AtomicU64>>) -> Self {
        Self {
            counters,
            saves: 0,
            drifted: 0,
            last: None,
        }
    }

    fn sum(&self) -> u64 {
        self.counters
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.load(Ordering::SeqCst)))
    }
}

impl CheckpointImage for FreezeProbe {
    fn save(&mut self, frozen: &FrozenProcess) -> freezeframe::Result<()> {
        let before = self.sum();
        std::thread::sleep(Duration::from_millis(5));
        if self.sum() != before {
            self.drifted += 1;
        }
        self.saves += 1;
        self.last = Some(*frozen);
        Ok(())
    }

    fn load(&mut self, _frozen: &FrozenProcess) -> freezeframe::Result<()> {
        Ok(())
    }
}
