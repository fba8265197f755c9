//! Allocation engine
//!
//! Small objects are carved out of the thread's [`AllocContext`] without any
//! synchronization. Everything else (a full context, large or pinned
//! objects, finalizable types, a pending allocation sample) goes through the
//! collector, which may refill the context. One failed slow-path attempt
//! triggers a blocking full collection and a single retry.

use crate::alloc_context::AllocContext;
use crate::collector::{CollectionMode, MAX_GENERATION};
use crate::config::GcConfig;
use crate::env::GcEnv;
use crate::error::{GcError, GcResult};
use crate::layout::{self, PointerWidth};
use crate::mutator;
use crate::object::{AllocFlags, ObjectRef, TypeDescriptor};
use crate::sampling::{AllocationSample, AllocationSampler};
use crate::thread::ThreadRecord;

/// Allocation policy shared by every thread of an environment
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    width: PointerWidth,
    large_object_threshold: usize,
    sampling_forced: bool,
    sampling_mean: u64,
}

impl AllocationEngine {
    /// Create an engine; `collector_threshold` is the collector's own
    /// large-object threshold, the larger of the two wins
    pub fn new(config: &GcConfig, collector_threshold: usize, width: PointerWidth) -> Self {
        Self {
            width,
            large_object_threshold: config.large_object_threshold.max(collector_threshold),
            sampling_forced: config.allocation_sampling,
            sampling_mean: config.sampling_mean_bytes,
        }
    }

    /// Pointer width used for size computations
    pub fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    /// Effective large-object threshold
    pub fn large_object_threshold(&self) -> usize {
        self.large_object_threshold
    }

    /// Flags an allocation of `desc` at `size` bytes actually carries
    pub fn effective_flags(&self, desc: &TypeDescriptor, size: u64, flags: AllocFlags) -> AllocFlags {
        let mut flags = flags;
        if desc.has_finalizer() {
            flags |= AllocFlags::FINALIZE;
        }
        if desc.contains_references {
            flags |= AllocFlags::CONTAINS_REFERENCES;
        }
        if size >= self.large_object_threshold as u64 {
            flags |= AllocFlags::LARGE_OBJECT_HEAP;
        }
        flags
    }

    /// Allocate and initialize one object on `thread`.
    pub fn allocate(
        &self,
        env: &GcEnv,
        thread: &ThreadRecord,
        desc: &'static TypeDescriptor,
        flags: AllocFlags,
        element_count: u64,
    ) -> GcResult<ObjectRef> {
        if !thread.is_cooperative() {
            return Err(GcError::invariant("allocation from a preemptive thread"));
        }
        if thread.in_no_gc_region() {
            return Err(GcError::invariant("allocation inside a no-GC region"));
        }

        let size = layout::object_size(desc, element_count, self.width)?;
        let flags = self.effective_flags(desc, size, flags);
        if flags.is_user_old_heap() {
            layout::check_user_old_heap_size(size, self.width)?;
        }
        let size = layout::host_footprint(desc, size)?;
        let length = usize::try_from(element_count).map_err(|_| GcError::Overflow)?;

        if !flags.intersects(AllocFlags::FINALIZE | AllocFlags::USER_OLD_HEAP) {
            // SAFETY: the record belongs to the calling cooperative thread and
            // no other borrow of its context is alive
            let ctx = unsafe { thread.alloc_context_mut() };
            if let Some(addr) = ctx.bump(size) {
                let obj = ObjectRef::from_address(addr)
                    .ok_or_else(|| GcError::invariant("allocation context handed out null"))?;
                // SAFETY: fresh memory from the context, owned by this thread
                unsafe { obj.initialize(desc, length) };
                thread.record_last_allocation(desc);
                return Ok(obj);
            }
        }

        self.allocate_slow(env, thread, desc, flags, size, length)
    }

    fn allocate_slow(
        &self,
        env: &GcEnv,
        thread: &ThreadRecord,
        desc: &'static TypeDescriptor,
        flags: AllocFlags,
        size: usize,
        length: usize,
    ) -> GcResult<ObjectRef> {
        // The slow path is a safe point
        mutator::poll(env.coordinator(), thread);

        let sampling = self.sampling_forced || env.events().allocation_sampling_enabled();
        let uoh = flags.is_user_old_heap();

        let sampled_offset = if sampling {
            // SAFETY: owner thread; the sampler and the context are disjoint
            let sampler = unsafe { self.sampler(thread) };
            let ctx = unsafe { thread.alloc_context() };
            sample_offset(&ctx, size, uoh, || sampler.next_budget())
        } else {
            None
        };

        let obj = self.allocate_memory(env, thread, flags, size)?;

        // SAFETY: fresh memory returned to this thread only
        unsafe { obj.initialize(desc, length) };

        // SAFETY: owner thread, no other borrow alive
        let ctx = unsafe { thread.alloc_context_mut() };
        if uoh {
            ctx.alloc_bytes_uoh += size as u64;
        }
        if sampling {
            // SAFETY: owner thread
            let budget = unsafe { self.sampler(thread) }.next_budget();
            ctx.set_sampling_budget(Some(budget));
        } else {
            ctx.set_sampling_budget(None);
        }

        if uoh {
            env.collector().publish_object(obj);
        }
        thread.record_last_allocation(desc);

        if let Some(offset) = sampled_offset {
            let sample = AllocationSample {
                object: obj,
                size,
                sampled_offset: offset,
            };
            tracing::trace!(target: "ee_gc::alloc", object = ?obj, size, offset, "allocation sampled");
            env.events().allocation_sampled(&sample);
        }
        Ok(obj)
    }

    fn allocate_memory(
        &self,
        env: &GcEnv,
        thread: &ThreadRecord,
        flags: AllocFlags,
        size: usize,
    ) -> GcResult<ObjectRef> {
        {
            // SAFETY: owner thread, no other borrow alive
            let ctx = unsafe { thread.alloc_context_mut() };

            // Crossing the sampling point but still inside the region
            if !flags.intersects(AllocFlags::FINALIZE | AllocFlags::USER_OLD_HEAP) {
                if let Some(addr) = ctx.bump_to_limit(size) {
                    return ObjectRef::from_address(addr)
                        .ok_or_else(|| GcError::invariant("allocation context handed out null"));
                }
            }

            if let Some(obj) = try_collector(env, ctx, size, flags) {
                return Ok(obj);
            }
        }

        tracing::debug!(
            target: "ee_gc::alloc",
            thread = thread.id(),
            size,
            flags = flags.bits(),
            "allocation failed, collecting"
        );
        // The context borrow is dropped: the collector may retire it
        env.collector()
            .garbage_collect(env, MAX_GENERATION, true, CollectionMode::Blocking)?;

        // SAFETY: owner thread, the collector is done with the context
        let ctx = unsafe { thread.alloc_context_mut() };
        match try_collector(env, ctx, size, flags) {
            Some(obj) => Ok(obj),
            None => {
                tracing::warn!(target: "ee_gc::alloc", thread = thread.id(), size, "out of memory");
                Err(GcError::OutOfMemory)
            }
        }
    }

    /// # Safety
    /// Owner thread only.
    #[allow(clippy::mut_from_ref)]
    unsafe fn sampler<'a>(&self, thread: &'a ThreadRecord) -> &'a mut AllocationSampler {
        // SAFETY: forwarded to the caller
        unsafe { thread.sampler_mut() }
            .get_or_insert_with(|| AllocationSampler::new(self.sampling_mean))
    }
}

/// One collector attempt; the context is restored byte-for-byte on failure.
fn try_collector(env: &GcEnv, ctx: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<ObjectRef> {
    let snapshot = *ctx;
    let obj = env.collector().allocate(ctx, size, flags);
    if obj.is_none() {
        *ctx = snapshot;
    }
    obj
}

/// Where, if anywhere, a slow-path allocation of `size` covers the sampled byte.
///
/// `draw` produces the distance to a freshly drawn sampling point, used when
/// the object extends into address space the context never covered.
fn sample_offset(ctx: &AllocContext, size: usize, uoh: bool, draw: impl FnOnce() -> u64) -> Option<usize> {
    if size == 0 {
        return None;
    }
    if uoh {
        let r = draw();
        return (r < size as u64).then_some(r as usize);
    }
    let before_sample = ctx.remaining_before_sample();
    if size <= before_sample {
        return None;
    }
    if ctx.combined_limit() < ctx.alloc_limit() {
        // The sampling point lies inside this context and the object covers it
        return Some(before_sample.min(size - 1));
    }
    let available = ctx.remaining();
    let spill = (size - available) as u64;
    let r = draw();
    (r < spill).then(|| available + r as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(start: usize, limit: usize, budget: Option<u64>) -> AllocContext {
        let mut ctx = AllocContext::new();
        ctx.set_region(start, limit);
        ctx.set_sampling_budget(budget);
        ctx
    }

    #[test]
    fn test_no_sample_below_sampling_point() {
        let ctx = context(0x1000, 0x2000, Some(0x100));
        assert_eq!(sample_offset(&ctx, 0x80, false, || unreachable!()), None);
    }

    #[test]
    fn test_sample_when_crossing_sampling_point() {
        let ctx = context(0x1000, 0x2000, Some(0x100));
        assert_eq!(sample_offset(&ctx, 0x180, false, || unreachable!()), Some(0x100));
    }

    #[test]
    fn test_spill_past_context_draws() {
        // No sampling point inside the context; 16 bytes left, 24 requested
        let ctx = context(0x1000, 0x1010, Some(u64::MAX));
        assert_eq!(sample_offset(&ctx, 24, false, || 3), Some(0x10 + 3));
        assert_eq!(sample_offset(&ctx, 24, false, || 8), None);
    }

    #[test]
    fn test_user_old_heap_sampling_proportional_to_size() {
        let ctx = AllocContext::new();
        assert_eq!(sample_offset(&ctx, 100_000, true, || 99_999), Some(99_999));
        assert_eq!(sample_offset(&ctx, 100_000, true, || 100_000), None);
    }

    #[test]
    fn test_effective_flags() {
        fn finalize(_: ObjectRef) {}
        static FINALIZABLE: TypeDescriptor = TypeDescriptor::object("F", 24).with_finalizer(finalize);
        static BYTES: TypeDescriptor = TypeDescriptor::array("Bytes", 24, 1);
        let engine = AllocationEngine::new(&GcConfig::default(), 0, PointerWidth::W64);

        let f = engine.effective_flags(&FINALIZABLE, 24, AllocFlags::NONE);
        assert!(f.contains(AllocFlags::FINALIZE));
        assert!(!f.intersects(AllocFlags::USER_OLD_HEAP));

        let big = engine.effective_flags(&BYTES, 85_000, AllocFlags::NONE);
        assert!(big.contains(AllocFlags::LARGE_OBJECT_HEAP));
        let small = engine.effective_flags(&BYTES, 84_999, AllocFlags::NONE);
        assert!(!small.is_user_old_heap());
    }

    #[test]
    fn test_collector_threshold_takes_max() {
        let engine = AllocationEngine::new(&GcConfig::default(), 120_000, PointerWidth::W64);
        assert_eq!(engine.large_object_threshold(), 120_000);
        let engine = AllocationEngine::new(&GcConfig::default(), 1_000, PointerWidth::W64);
        assert_eq!(engine.large_object_threshold(), 85_000);
    }
}
