//! Runtime configuration for the EE/GC boundary

use std::time::Duration;

/// Objects at or above this many bytes go to the large object heap.
pub const LARGE_OBJECT_THRESHOLD: usize = 85_000;

/// Mean distance in bytes between two allocation samples.
pub const DEFAULT_SAMPLING_MEAN: u64 = 100 * 1024;

/// Hardware memory-ordering class of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryModel {
    /// x86-style total store order; compiler ordering is enough
    Strong,
    /// ARM/RISC-V style; explicit fences are required
    Weak,
}

impl MemoryModel {
    /// Memory model of the architecture this crate was compiled for
    pub const fn native() -> Self {
        if cfg!(any(
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "riscv64",
            target_arch = "powerpc64",
            target_arch = "loongarch64"
        )) {
            MemoryModel::Weak
        } else {
            MemoryModel::Strong
        }
    }

    /// Whether explicit fences are needed to order stores across CPUs
    pub const fn is_weak(self) -> bool {
        matches!(self, MemoryModel::Weak)
    }
}

/// Configuration for a [`GcEnv`](crate::GcEnv)
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Large object threshold in bytes (default: 85 000)
    pub large_object_threshold: usize,
    /// Force allocation sampling on even if the event sink does not ask for it
    pub allocation_sampling: bool,
    /// Mean bytes between allocation samples (default: 100KB)
    pub sampling_mean_bytes: u64,
    /// How long the coordinator waits for threads to park before re-hijacking
    pub suspend_ping_timeout: Duration,
    /// Give up (fatally) when a thread refuses to park for this long
    pub suspend_deadlock_timeout: Option<Duration>,
    /// Cool-down after the finalizer reacts to a memory-pressure signal
    pub finalizer_pressure_cooldown: Duration,
    /// Periodic wake-up of an idle finalizer worker (None: wait for a signal)
    pub finalizer_idle_timeout: Option<Duration>,
    /// Memory model used to decide where fences are issued
    pub memory_model: MemoryModel,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
            allocation_sampling: false,
            sampling_mean_bytes: DEFAULT_SAMPLING_MEAN,
            suspend_ping_timeout: Duration::from_millis(1),
            suspend_deadlock_timeout: None,
            finalizer_pressure_cooldown: Duration::from_secs(2),
            finalizer_idle_timeout: None,
            memory_model: MemoryModel::native(),
        }
    }
}
