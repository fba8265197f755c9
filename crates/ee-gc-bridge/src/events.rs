//! Runtime event observer
//!
//! The core never checks whether anyone listens; it calls the sink and the
//! no-op implementation compiles away.

use crate::sampling::AllocationSample;
use crate::suspend::SuspendReason;

/// Observer for allocation, suspension and finalization events
pub trait EventSink: Send + Sync {
    /// Whether allocation sampling should be armed
    fn allocation_sampling_enabled(&self) -> bool {
        false
    }

    /// An allocation covered a sampled byte
    fn allocation_sampled(&self, _sample: &AllocationSample) {}

    /// A suspension cycle is starting
    fn suspend_begin(&self, _reason: SuspendReason) {}

    /// Every thread is parked
    fn suspend_end(&self, _reason: SuspendReason, _hijacked: usize) {}

    /// Restart is starting
    fn restart_begin(&self) {}

    /// Threads have been released
    fn restart_end(&self, _finished_gc: bool) {}

    /// The finalizer worker finished draining its queue
    fn finalizer_drained(&self, _finalized: usize, _skipped: usize) {}
}

/// Sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

/// Sink that forwards events to `tracing` at trace level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink {
    /// Also arm allocation sampling
    pub sample_allocations: bool,
}

impl EventSink for TracingEventSink {
    fn allocation_sampling_enabled(&self) -> bool {
        self.sample_allocations
    }

    fn allocation_sampled(&self, sample: &AllocationSample) {
        tracing::trace!(
            target: "ee_gc::events",
            object = ?sample.object,
            size = sample.size,
            offset = sample.sampled_offset,
            "allocation sampled"
        );
    }

    fn suspend_begin(&self, reason: SuspendReason) {
        tracing::trace!(target: "ee_gc::events", ?reason, "suspend begin");
    }

    fn suspend_end(&self, reason: SuspendReason, hijacked: usize) {
        tracing::trace!(target: "ee_gc::events", ?reason, hijacked, "suspend end");
    }

    fn restart_begin(&self) {
        tracing::trace!(target: "ee_gc::events", "restart begin");
    }

    fn restart_end(&self, finished_gc: bool) {
        tracing::trace!(target: "ee_gc::events", finished_gc, "restart end");
    }

    fn finalizer_drained(&self, finalized: usize, skipped: usize) {
        tracing::trace!(target: "ee_gc::events", finalized, skipped, "finalizer drained");
    }
}
