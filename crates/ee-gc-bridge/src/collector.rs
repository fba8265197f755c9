//! The collector seen from the execution engine
//!
//! The collector owns the heap and the finalization queue. This crate only
//! drives it through [`Collector`] and enforces the rules both sides rely on.

use crate::alloc_context::AllocContext;
use crate::config::LARGE_OBJECT_THRESHOLD;
use crate::env::GcEnv;
use crate::error::GcResult;
use crate::object::{AllocFlags, ObjectRef};

/// Oldest generation; a collection of it is a full collection
pub const MAX_GENERATION: i32 = 2;

/// How hard a requested collection should try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Collector decides
    Default,
    /// Collect even if the collector would not
    Forced,
    /// Collect only if it is likely to pay off
    Optimized,
    /// Do not return before the collection is complete
    Blocking,
}

/// Result of a collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// A collection ran
    Completed {
        /// Objects that became ready for finalization
        finalizable: usize,
    },
    /// The collector chose not to collect
    Skipped,
}

/// Deferred collector work run on the finalizer thread before any finalizer
pub struct FinalizationWorkItem {
    /// Short label used in logs
    pub label: &'static str,
    /// The work itself
    pub callback: Box<dyn FnOnce() + Send>,
}

impl FinalizationWorkItem {
    /// Wrap a closure
    pub fn new(label: &'static str, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for FinalizationWorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationWorkItem")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Operations the engine consumes from the collector
pub trait Collector: Send + Sync {
    /// Called once the environment is built. Typically publishes the initial
    /// write barrier.
    fn initialize(&self, _env: &GcEnv) -> GcResult<()> {
        Ok(())
    }

    /// Allocate `size` bytes, refilling `ctx` if needed.
    ///
    /// Must not collect. On failure `ctx` is left as it was. Returned memory
    /// is zeroed unless `ZEROING_OPTIONAL` is set.
    fn allocate(&self, ctx: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<ObjectRef>;

    /// Run a collection. Called from a cooperative thread that holds no
    /// borrow of its allocation context.
    fn garbage_collect(
        &self,
        env: &GcEnv,
        generation: i32,
        low_memory: bool,
        mode: CollectionMode,
    ) -> GcResult<CollectionOutcome>;

    /// Dequeue the next object ready for finalization
    fn get_next_finalizable(&self) -> Option<ObjectRef>;

    /// Take pending auxiliary work
    fn get_extra_finalization_work(&self) -> Vec<FinalizationWorkItem> {
        Vec::new()
    }

    /// Mark `obj` as not needing its finalizer
    fn set_finalization_run(&self, obj: ObjectRef);

    /// Put `obj` back on the finalization queue; false if the collector
    /// does not know the object
    fn register_for_finalization(&self, obj: ObjectRef) -> bool;

    /// Size at which allocations go to the large object heap
    fn large_object_threshold(&self) -> usize {
        LARGE_OBJECT_THRESHOLD
    }

    /// A user-old-heap object has been fully initialized
    fn publish_object(&self, _obj: ObjectRef) {}

    /// Make a departing thread's context walkable
    fn fix_alloc_context(&self, ctx: &mut AllocContext) {
        ctx.retire();
    }
}
