//! Randomized allocation sampling
//!
//! Each thread draws the distance to its next sampled byte from a geometric
//! distribution (approximated by an exponential one, rounded down). The
//! distribution is memoryless, so the budget can be redrawn whenever the
//! combined limit is recomputed without biasing the samples.

use crate::object::ObjectRef;
use rand_core::{OsRng, RngCore};

/// One sampled allocation, reported to the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSample {
    /// The object that covered the sampled byte
    pub object: ObjectRef,
    /// Aligned size of the object
    pub size: usize,
    /// Offset of the sampled byte from the start of the object
    pub sampled_offset: usize,
}

/// Per-thread sampling state; owned by the thread record
pub struct AllocationSampler {
    mean: f64,
    rng: Box<dyn RngCore + Send>,
}

impl AllocationSampler {
    /// Sampler backed by the OS random source
    pub fn new(mean_bytes: u64) -> Self {
        Self::with_rng(mean_bytes, Box::new(OsRng))
    }

    /// Sampler with a caller-provided random source
    pub fn with_rng(mean_bytes: u64, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            mean: mean_bytes.max(1) as f64,
            rng,
        }
    }

    /// Draw the number of bytes until the next sampled byte.
    pub fn next_budget(&mut self) -> u64 {
        // 53 random mantissa bits -> uniform in [0, 1)
        let uniform = (self.rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
        let bytes = -(1.0 - uniform).ln() * self.mean;
        if bytes >= u64::MAX as f64 {
            u64::MAX
        } else {
            bytes as u64
        }
    }
}

impl std::fmt::Debug for AllocationSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationSampler")
            .field("mean", &self.mean)
            .finish_non_exhaustive()
    }
}
