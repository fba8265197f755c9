//! Per-thread GC mode state
//!
//! A thread in **cooperative** mode may hold raw references into the heap and
//! must be brought to a safe point before a collection. A thread in
//! **preemptive** mode holds none and is ignored by the coordinator.
//!
//! Only the owning thread ever writes its own mode flag. The coordinator
//! forces progress by planting a hijack that the thread takes at its next
//! poll, never by flipping the flag underneath it.

use crate::alloc_context::AllocContext;
use crate::object::TypeDescriptor;
use crate::sampling::AllocationSampler;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;

/// GC mode of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// May touch raw heap references
    Cooperative,
    /// Parked outside the heap
    Preemptive,
}

/// One record per attached OS thread
pub struct ThreadRecord {
    id: u64,
    os_thread: ThreadId,
    name: Option<String>,
    /// Read by the coordinator, written only by the owner
    cooperative: CachePadded<AtomicBool>,
    gc_special: bool,
    /// Set by the safepoint capability; consumed at the owner's next poll
    hijack_pending: AtomicBool,
    non_reportable_depth: AtomicU32,
    no_gc_depth: AtomicU32,
    transition_frame: AtomicUsize,
    /// Diagnostics only; relaxed and racy
    last_alloc_type: AtomicPtr<TypeDescriptor>,
    alloc_context: UnsafeCell<AllocContext>,
    sampler: UnsafeCell<Option<AllocationSampler>>,
}

// SAFETY: the UnsafeCell fields are only touched by the owning thread, or by
// the collector while the owner is stopped (see `alloc_context_mut`). Every
// other field is atomic or immutable.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub(crate) fn new(id: u64, os_thread: ThreadId, name: Option<String>, gc_special: bool) -> Self {
        Self {
            id,
            os_thread,
            name,
            // New threads start outside the heap
            cooperative: CachePadded::new(AtomicBool::new(false)),
            gc_special,
            hijack_pending: AtomicBool::new(false),
            non_reportable_depth: AtomicU32::new(0),
            no_gc_depth: AtomicU32::new(0),
            transition_frame: AtomicUsize::new(0),
            last_alloc_type: AtomicPtr::new(ptr::null_mut()),
            alloc_context: UnsafeCell::new(AllocContext::new()),
            sampler: UnsafeCell::new(None),
        }
    }

    /// Registry-unique id (never 0)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS thread that owns the record
    pub fn os_thread(&self) -> ThreadId {
        self.os_thread
    }

    /// Thread name given at attach time
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the thread is currently cooperative
    pub fn is_cooperative(&self) -> bool {
        self.cooperative.load(Ordering::SeqCst)
    }

    /// Current mode
    pub fn mode(&self) -> GcMode {
        if self.is_cooperative() {
            GcMode::Cooperative
        } else {
            GcMode::Preemptive
        }
    }

    /// Collector worker threads never hold unstable state across a safepoint
    pub fn is_gc_special(&self) -> bool {
        self.gc_special
    }

    pub(crate) fn set_cooperative(&self, cooperative: bool) {
        self.cooperative.store(cooperative, Ordering::SeqCst);
    }

    /// Plant a redirect the thread takes at its next safepoint poll
    pub fn plant_hijack(&self) {
        self.hijack_pending.store(true, Ordering::SeqCst);
    }

    /// Remove a planted redirect
    pub fn clear_hijack(&self) {
        self.hijack_pending.store(false, Ordering::SeqCst);
    }

    /// Whether a redirect is planted
    pub fn is_hijacked(&self) -> bool {
        self.hijack_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn take_hijack(&self) -> bool {
        self.hijack_pending.swap(false, Ordering::SeqCst)
    }

    /// Whether the thread is inside a window where its state is not reportable
    pub fn in_non_reportable_region(&self) -> bool {
        self.non_reportable_depth.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn enter_non_reportable(&self) {
        self.non_reportable_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_non_reportable(&self) {
        self.non_reportable_depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether the thread is inside a "do not trigger GC" region
    pub fn in_no_gc_region(&self) -> bool {
        self.no_gc_depth.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn enter_no_gc(&self) {
        self.no_gc_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_no_gc(&self) {
        self.no_gc_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Transition frame token of the native call in progress (0 when none)
    pub fn transition_frame(&self) -> usize {
        self.transition_frame.load(Ordering::Relaxed)
    }

    pub(crate) fn set_transition_frame(&self, frame: usize) {
        self.transition_frame.store(frame, Ordering::Relaxed);
    }

    /// Type of the most recent allocation on this thread (best effort)
    pub fn last_allocated_type(&self) -> Option<&'static TypeDescriptor> {
        let ptr = self.last_alloc_type.load(Ordering::Relaxed);
        // SAFETY: only 'static descriptors are ever stored
        unsafe { ptr.as_ref() }
    }

    pub(crate) fn record_last_allocation(&self, desc: &'static TypeDescriptor) {
        self.last_alloc_type.store(
            desc as *const TypeDescriptor as *mut TypeDescriptor,
            Ordering::Relaxed,
        );
    }

    /// Mutable access to the allocation context.
    ///
    /// # Safety
    /// The caller must be the owning thread, or the collector while the owner
    /// is stopped, and must not let two such references coexist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn alloc_context_mut(&self) -> &mut AllocContext {
        // SAFETY: exclusivity is the caller's obligation
        unsafe { &mut *self.alloc_context.get() }
    }

    /// Copy of the allocation context.
    ///
    /// # Safety
    /// Same as [`ThreadRecord::alloc_context_mut`].
    pub unsafe fn alloc_context(&self) -> AllocContext {
        // SAFETY: exclusivity is the caller's obligation
        unsafe { *self.alloc_context.get() }
    }

    /// # Safety
    /// Owning thread only.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn sampler_mut(&self) -> &mut Option<AllocationSampler> {
        // SAFETY: the sampler is never touched by anyone but the owner
        unsafe { &mut *self.sampler.get() }
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("gc_special", &self.gc_special)
            .field("hijacked", &self.is_hijacked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ThreadRecord {
        ThreadRecord::new(1, std::thread::current().id(), Some("t".into()), false)
    }

    #[test]
    fn test_new_thread_is_preemptive() {
        let rec = record();
        assert_eq!(rec.mode(), GcMode::Preemptive);
        assert!(!rec.is_gc_special());
        assert!(rec.last_allocated_type().is_none());
    }

    #[test]
    fn test_hijack_taken_once() {
        let rec = record();
        rec.plant_hijack();
        assert!(rec.is_hijacked());
        assert!(rec.take_hijack());
        assert!(!rec.take_hijack());
    }

    #[test]
    fn test_nested_regions() {
        let rec = record();
        rec.enter_non_reportable();
        rec.enter_non_reportable();
        rec.leave_non_reportable();
        assert!(rec.in_non_reportable_region());
        rec.leave_non_reportable();
        assert!(!rec.in_non_reportable_region());

        rec.enter_no_gc();
        assert!(rec.in_no_gc_region());
        rec.leave_no_gc();
        assert!(!rec.in_no_gc_region());
    }
}
