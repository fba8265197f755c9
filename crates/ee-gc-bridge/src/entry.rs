//! Exported entry points
//!
//! The boundary the rest of the runtime calls. Allocation failures come back
//! as `None`; broken invariants and failed suspensions terminate the process.

use crate::barrier::WriteBarrierParameters;
use crate::env::GcEnv;
use crate::error::{GcResult, fail_fast};
use crate::mutator::MutatorThread;
use crate::object::{AllocFlags, ObjectRef, TypeDescriptor};
use crate::suspend::SuspendReason;
use std::time::Duration;

/// Timeout value meaning "wait forever"
pub const INFINITE: u32 = u32::MAX;

/// Opaque token identifying the managed-to-native transition of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionFrame(pub usize);

fn or_fail_fast<T>(result: GcResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fail_fast(&err),
    }
}

/// Allocate an object on behalf of managed code.
///
/// `flag_bits` uses the public [`AllocFlags`] encoding; unknown bits are
/// ignored. Returns `None` on overflow or when the heap is exhausted.
pub fn gc_alloc(
    thread: &MutatorThread,
    desc: &'static TypeDescriptor,
    flag_bits: u32,
    element_count: u64,
    frame: TransitionFrame,
) -> Option<ObjectRef> {
    let record = thread.record();
    record.set_transition_frame(frame.0);
    let result = thread.allocate(desc, AllocFlags::from_bits_truncate(flag_bits), element_count);
    record.set_transition_frame(0);
    match result {
        Ok(obj) => Some(obj),
        Err(err) if err.is_fatal() => fail_fast(&err),
        Err(err) => {
            tracing::debug!(target: "ee_gc::alloc", ty = desc.name, element_count, %err, "allocation failed");
            None
        }
    }
}

/// Stop the world
pub fn gc_suspend_runtime(env: &GcEnv, reason: SuspendReason) {
    or_fail_fast(env.suspend(reason));
}

/// Restart the world stopped by the caller
pub fn gc_restart_runtime(env: &GcEnv, finished_gc: bool) {
    or_fail_fast(env.restart(finished_gc));
}

/// Allow the finalizer thread to start
pub fn gc_finalizer_initialize(env: &GcEnv) -> bool {
    env.initialize_finalizer()
}

/// Wake the finalizer thread
pub fn gc_enable_finalization(env: &GcEnv) {
    env.enable_finalization();
}

/// Wait for pending finalizers; `timeout_ms` of [`INFINITE`] waits forever.
/// Returns false on timeout.
pub fn gc_wait_for_pending_finalizers(env: &GcEnv, allow_reentrant: bool, timeout_ms: u32) -> bool {
    let timeout = (timeout_ms != INFINITE).then(|| Duration::from_millis(u64::from(timeout_ms)));
    or_fail_fast(env.wait_for_pending_finalizers(allow_reentrant, timeout))
}

/// Next object whose finalizer must run
pub fn gc_get_next_finalizable(env: &GcEnv) -> Option<ObjectRef> {
    env.get_next_finalizable()
}

/// Announce that a drain of the finalization queue completed
pub fn gc_signal_finalization_complete(env: &GcEnv) {
    env.signal_finalization_complete();
}

/// Apply a write barrier update from the collector
pub fn gc_stomp_write_barrier(env: &GcEnv, params: WriteBarrierParameters) {
    or_fail_fast(env.stomp_write_barrier(params));
}
