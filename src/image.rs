//! Checkpoint-image collaborator.
//!
//! The coordinator calls into an image while every other tracked thread is
//! frozen: `save` during a checkpoint, `load` during a restore. Implementations
//! must not spawn threads, and must not take locks (the allocator's included)
//! that a frozen thread might be holding.

use crate::error::Result;

/// What the image gets to see of a frozen process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenProcess {
    /// Threads parked in the suspend handler, the coordinator excluded.
    pub suspended: usize,
    /// 1-based count of suspension rounds run by this coordinator.
    pub round: u64,
}

pub trait CheckpointImage {
    /// Process memory is frozen and safe to read.
    fn save(&mut self, frozen: &FrozenProcess) -> Result<()>;

    /// Process memory is frozen and may be overwritten in place.
    fn load(&mut self, frozen: &FrozenProcess) -> Result<()>;
}

/// How a `checkpoint()` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The image was written and every thread resumed.
    Checkpointed,
    /// Control came back here through `restore()`.
    Restored,
}

/// An image that records nothing. Loading it leaves memory untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullImage {
    pub saves: u64,
    pub loads: u64,
    pub last: Option<FrozenProcess>,
}

impl NullImage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointImage for NullImage {
    fn save(&mut self, frozen: &FrozenProcess) -> Result<()> {
        self.saves += 1;
        self.last = Some(*frozen);
        Ok(())
    }

    fn load(&mut self, frozen: &FrozenProcess) -> Result<()> {
        self.loads += 1;
        self.last = Some(*frozen);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_image_counts() {
        let mut img = NullImage::new();
        let frozen = FrozenProcess {
            suspended: 3,
            round: 1,
        };
        img.save(&frozen).unwrap();
        img.load(&frozen).unwrap();
        img.save(&FrozenProcess { round: 2, ..frozen }).unwrap();
        assert_eq!(img.saves, 2);
        assert_eq!(img.loads, 1);
        assert_eq!(img.last.map(|f| f.round), Some(2));
    }
}
