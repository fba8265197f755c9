//! Mode transitions and the attached-thread handle
//!
//! Entering cooperative mode is a Dekker-style handshake with the
//! coordinator: the thread stores its mode flag then loads the trap flag,
//! the coordinator stores the trap flag, fences, then loads mode flags. With
//! all four accesses sequentially consistent at least one side sees the
//! other, so a thread is never running cooperatively behind the
//! coordinator's back.

use crate::alloc_context::AllocContext;
use crate::barrier::BarrierView;
use crate::collector::{CollectionMode, CollectionOutcome};
use crate::env::GcEnv;
use crate::error::GcResult;
use crate::object::{AllocFlags, ObjectRef, TypeDescriptor};
use crate::sampling::AllocationSampler;
use crate::suspend::SuspensionCoordinator;
use crate::thread::ThreadRecord;
use std::marker::PhantomData;
use std::sync::Arc;

/// Switch `record` to cooperative mode, waiting out any suspension that does
/// not belong to it.
pub(crate) fn enter_cooperative(coordinator: &SuspensionCoordinator, record: &ThreadRecord) {
    loop {
        if coordinator.is_trapping() && !coordinator.is_suspending_thread(record) {
            coordinator.wait_for_restart();
            continue;
        }
        record.set_cooperative(true);
        if !coordinator.is_trapping() || coordinator.is_suspending_thread(record) {
            return;
        }
        // Lost the race with a suspension that started after our check
        record.set_cooperative(false);
        coordinator.notify_parked();
    }
}

/// Switch `record` to preemptive mode and report in if a suspension waits.
pub(crate) fn enter_preemptive(coordinator: &SuspensionCoordinator, record: &ThreadRecord) {
    record.set_cooperative(false);
    if coordinator.is_trapping() {
        coordinator.notify_parked();
    }
}

/// Take a planted hijack or a pending trap: park, then come back once the
/// world restarts.
pub(crate) fn poll(coordinator: &SuspensionCoordinator, record: &ThreadRecord) {
    let hijacked = record.take_hijack();
    let trapped = coordinator.is_trapping() && !coordinator.is_suspending_thread(record);
    if (hijacked || trapped) && record.is_cooperative() {
        tracing::trace!(target: "ee_gc::threads", id = record.id(), hijacked, "parking at safe point");
        enter_preemptive(coordinator, record);
        enter_cooperative(coordinator, record);
    }
}

/// Handle of an attached OS thread.
///
/// Not `Send`: the handle is the thread. Dropping it detaches the thread.
pub struct MutatorThread {
    env: Arc<GcEnv>,
    record: Arc<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl MutatorThread {
    pub(crate) fn new(env: Arc<GcEnv>, record: Arc<ThreadRecord>) -> Self {
        Self {
            env,
            record,
            _not_send: PhantomData,
        }
    }

    /// Environment this thread is attached to
    pub fn env(&self) -> &Arc<GcEnv> {
        &self.env
    }

    /// The thread's record
    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// Registry id
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    /// Whether the thread is cooperative
    pub fn is_cooperative(&self) -> bool {
        self.record.is_cooperative()
    }

    /// Enter cooperative mode, blocking while a suspension is in progress
    pub fn enter_cooperative(&self) {
        enter_cooperative(self.env.coordinator(), &self.record);
    }

    /// Enter preemptive mode
    pub fn enter_preemptive(&self) {
        enter_preemptive(self.env.coordinator(), &self.record);
    }

    /// Safe point: honor a pending suspension
    pub fn poll(&self) {
        poll(self.env.coordinator(), &self.record);
    }

    /// Run `f` as a blocking call outside the heap
    pub fn preemptive<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_cooperative = self.is_cooperative();
        if was_cooperative {
            self.enter_preemptive();
        }
        let result = f();
        if was_cooperative {
            self.enter_cooperative();
        }
        result
    }

    /// Run `f` in cooperative mode, restoring the previous mode afterwards
    pub fn cooperative<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_cooperative = self.is_cooperative();
        if !was_cooperative {
            self.enter_cooperative();
        }
        let result = f();
        if !was_cooperative {
            self.enter_preemptive();
        }
        result
    }

    /// Mark a region in which nothing may trigger a collection
    pub fn no_gc_region(&self) -> NoGcRegion<'_> {
        self.record.enter_no_gc();
        NoGcRegion { thread: self }
    }

    /// Run `f` inside a window where the thread cannot be hijacked
    pub fn non_reportable_region<R>(&self, f: impl FnOnce() -> R) -> R {
        self.record.enter_non_reportable();
        let result = f();
        self.record.leave_non_reportable();
        result
    }

    /// Allocate an object of `desc`
    pub fn allocate(
        &self,
        desc: &'static TypeDescriptor,
        flags: AllocFlags,
        element_count: u64,
    ) -> GcResult<ObjectRef> {
        self.env
            .allocator()
            .allocate(&self.env, &self.record, desc, flags, element_count)
    }

    /// Allocate a non-array object
    pub fn allocate_object(&self, desc: &'static TypeDescriptor) -> GcResult<ObjectRef> {
        self.allocate(desc, AllocFlags::NONE, 0)
    }

    /// Allocate an array of `length` elements
    pub fn allocate_array(&self, desc: &'static TypeDescriptor, length: u64) -> GcResult<ObjectRef> {
        self.allocate(desc, AllocFlags::NONE, length)
    }

    /// Store `value` into the reference slot at `offset` inside `obj` and run
    /// the write barrier.
    ///
    /// # Safety
    /// The thread must be cooperative, `obj` must be live and the slot must
    /// lie inside it.
    pub unsafe fn store_reference(&self, obj: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        debug_assert!(self.is_cooperative());
        let slot = obj.address() + offset;
        let raw = value.map_or(0, ObjectRef::address);
        // SAFETY: caller guarantees the slot is inside a live object
        unsafe { (slot as *mut usize).write(raw) };
        if self.record.is_gc_special() {
            // Restarts do not wait for GC-special threads
            self.env.barrier().record_store_pinned(slot, raw);
        } else {
            // SAFETY: cooperative and not GC-special, so no restart can free
            // the tables while this runs
            unsafe { self.env.barrier().globals().record_store(slot, raw) };
        }
    }

    /// Barrier globals as this thread's store barrier sees them
    pub fn barrier_view(&self) -> BarrierView {
        if self.is_cooperative() && !self.record.is_gc_special() {
            // SAFETY: as in `store_reference`
            unsafe { self.env.barrier().globals().view() }
        } else {
            self.env.barrier_view()
        }
    }

    /// Request a collection from this thread
    pub fn collect(&self, generation: i32, mode: CollectionMode) -> GcResult<CollectionOutcome> {
        self.env.collect(generation, false, mode)
    }

    /// Replace the sampler; a default one is created on first use otherwise
    pub fn set_sampler(&self, sampler: AllocationSampler) {
        // SAFETY: owner thread
        unsafe { *self.record.sampler_mut() = Some(sampler) };
    }

    /// Copy of the allocation context
    pub fn alloc_context(&self) -> AllocContext {
        // SAFETY: owner thread; only a stopped world lets the collector in,
        // and this thread is running
        unsafe { self.record.alloc_context() }
    }

    /// Bytes handed to this thread so far
    pub fn allocated_bytes(&self) -> u64 {
        self.alloc_context().total_allocated()
    }
}

impl Drop for MutatorThread {
    fn drop(&mut self) {
        let coordinator = self.env.coordinator();
        // Keep the collector off the context while it is being fixed
        enter_cooperative(coordinator, &self.record);
        // SAFETY: owner thread, cooperative
        let ctx = unsafe { self.record.alloc_context_mut() };
        self.env.collector().fix_alloc_context(ctx);
        let allocated = ctx.total_allocated();
        self.env.registry().detach(&self.record, allocated);
        enter_preemptive(coordinator, &self.record);
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MutatorThread").field(&self.record).finish()
    }
}

/// Guard returned by [`MutatorThread::no_gc_region`]
pub struct NoGcRegion<'a> {
    thread: &'a MutatorThread,
}

impl Drop for NoGcRegion<'_> {
    fn drop(&mut self) {
        self.thread.record.leave_no_gc();
    }
}
