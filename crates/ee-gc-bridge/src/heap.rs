//! Reference heap
//!
//! `ArenaHeap` is a minimal [`Collector`]: it hands out allocation quanta and
//! large objects from one zeroed arena, keeps a root set and a finalization
//! queue, and drives collections through the suspension coordinator. It never
//! reclaims memory; "collecting" means stopping the world, making every
//! allocation context walkable, and moving unrooted finalizable objects to
//! the ready queue.

use crate::alloc_context::AllocContext;
use crate::barrier::{CardTable, WriteBarrierOp, WriteBarrierParameters};
use crate::collector::{CollectionMode, CollectionOutcome, Collector, FinalizationWorkItem};
use crate::env::GcEnv;
use crate::error::{GcError, GcResult, fail_fast};
use crate::layout::HOST_ALIGN;
use crate::object::{AllocFlags, HEADER_FINALIZER_RUN, ObjectRef};
use crate::suspend::SuspendReason;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Granularity at which the published heap bounds grow
pub const COMMIT_STEP: usize = 1 << 20;

const ARENA_ALIGN: usize = 16;

/// Reference heap configuration
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Arena size (default: 16MB)
    pub capacity: usize,
    /// Bytes handed to an allocation context per refill (default: 8KB)
    pub allocation_quantum: usize,
    /// Upper bound on large and pinned allocations (default: 64MB)
    pub large_object_budget: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: 16 * 1024 * 1024,
            allocation_quantum: 8 * 1024,
            large_object_budget: 64 * 1024 * 1024,
        }
    }
}

/// Zeroed backing memory
struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(capacity: usize) -> GcResult<Self> {
        let layout = Layout::from_size_align(capacity.max(ARENA_ALIGN), ARENA_ALIGN)
            .map_err(|_| GcError::OutOfMemory)?;
        // SAFETY: layout has non-zero size
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(GcError::OutOfMemory)?;
        Ok(Self { base, layout })
    }

    fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.start() + self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in `Arena::new` with the same layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

struct ArenaState {
    next: usize,
    large_bytes: usize,
    /// Upper heap bound currently published to the write barrier
    committed: usize,
}

#[derive(Default)]
struct FinalizationQueues {
    registered: Vec<ObjectRef>,
    ready: VecDeque<ObjectRef>,
    extra_work: Vec<FinalizationWorkItem>,
}

/// Heap statistics
#[derive(Debug, Default, Clone)]
pub struct ArenaStats {
    /// Collections run
    pub collections: u64,
    /// Bytes handed out (quanta plus large objects)
    pub bytes_reserved: usize,
    /// Bytes in large and pinned objects
    pub large_bytes: usize,
    /// User-old-heap objects published
    pub published: u64,
    /// Objects currently registered for finalization
    pub registered: usize,
    /// Objects ready for finalization
    pub ready: usize,
}

/// In-process reference collector
pub struct ArenaHeap {
    config: ArenaConfig,
    arena: Arena,
    state: Mutex<ArenaState>,
    /// Serializes bound growth so stomps are published in order
    growth: Mutex<()>,
    roots: Mutex<FxHashSet<ObjectRef>>,
    finalization: Mutex<FinalizationQueues>,
    env: Mutex<Weak<GcEnv>>,
    collections: AtomicU64,
    published: AtomicU64,
    gc_requests: AtomicUsize,
}

// SAFETY: the arena pointer is only handed out as addresses; all mutable
// state is behind locks or atomics.
unsafe impl Send for ArenaHeap {}
unsafe impl Sync for ArenaHeap {}

impl ArenaHeap {
    /// Create heap with default config
    pub fn new() -> GcResult<Self> {
        Self::with_config(ArenaConfig::default())
    }

    /// Create heap with custom config
    pub fn with_config(config: ArenaConfig) -> GcResult<Self> {
        let arena = Arena::new(config.capacity)?;
        let start = arena.start();
        let committed = (start + COMMIT_STEP).min(arena.end());
        Ok(Self {
            arena,
            state: Mutex::new(ArenaState {
                next: start,
                large_bytes: 0,
                committed,
            }),
            growth: Mutex::new(()),
            roots: Mutex::new(FxHashSet::default()),
            finalization: Mutex::new(FinalizationQueues::default()),
            env: Mutex::new(Weak::new()),
            collections: AtomicU64::new(0),
            published: AtomicU64::new(0),
            gc_requests: AtomicUsize::new(0),
            config,
        })
    }

    /// Get config
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// `[start, end)` of the arena
    pub fn bounds(&self) -> (usize, usize) {
        (self.arena.start(), self.arena.end())
    }

    /// Whether `obj` lives in this heap
    pub fn owns(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        addr >= self.arena.start() && addr < self.state.lock().next
    }

    /// Keep `obj` alive across collections
    pub fn pin_root(&self, obj: ObjectRef) {
        self.roots.lock().insert(obj);
    }

    /// Drop a root added with [`pin_root`](Self::pin_root)
    pub fn unpin_root(&self, obj: ObjectRef) -> bool {
        self.roots.lock().remove(&obj)
    }

    /// Queue auxiliary work for the finalizer thread
    pub fn queue_finalization_work(&self, item: FinalizationWorkItem) {
        self.finalization.lock().extra_work.push(item);
    }

    /// Number of collection requests received
    pub fn gc_requests(&self) -> usize {
        self.gc_requests.load(Ordering::Relaxed)
    }

    /// Get statistics
    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        let queues = self.finalization.lock();
        ArenaStats {
            collections: self.collections.load(Ordering::Relaxed),
            bytes_reserved: state.next - self.arena.start(),
            large_bytes: state.large_bytes,
            published: self.published.load(Ordering::Relaxed),
            registered: queues.registered.len(),
            ready: queues.ready.len(),
        }
    }

    /// Reserve `bytes` from the arena; returns the start and the new upper
    /// bound to publish, if the reservation crossed the committed bound.
    fn reserve(&self, bytes: usize, large: bool) -> Option<(usize, Option<usize>)> {
        let mut state = self.state.lock();
        if large && state.large_bytes + bytes > self.config.large_object_budget {
            return None;
        }
        let end = state.next.checked_add(bytes)?;
        if end > self.arena.end() {
            return None;
        }
        let start = state.next;
        state.next = end;
        if large {
            state.large_bytes += bytes;
        }
        let grown = if end > state.committed {
            let step = end.div_ceil(COMMIT_STEP) * COMMIT_STEP;
            state.committed = step.min(self.arena.end());
            Some(state.committed)
        } else {
            None
        };
        Some((start, grown))
    }

    /// Republish card table and bounds after the heap grew.
    fn publish_growth(&self, highest: usize) {
        let Some(env) = self.env.lock().upgrade() else {
            return;
        };
        let _growth = self.growth.lock();
        if env
            .barrier()
            .card_table()
            .is_some_and(|t| t.highest() >= highest)
        {
            return;
        }
        let lowest = self.arena.start();
        let op = WriteBarrierOp::StompResize {
            card_table: Arc::new(CardTable::new(lowest, highest)),
            lowest,
            highest,
        };
        let params = if env.is_world_stopped() {
            WriteBarrierParameters::suspended(op)
        } else {
            WriteBarrierParameters::running(op)
        };
        tracing::debug!(target: "ee_gc::barrier", highest = format_args!("{highest:#x}"), "heap grew");
        if let Err(err) = env.stomp_write_barrier(params) {
            fail_fast(&err);
        }
    }

    fn collect_stopped(&self, env: &GcEnv) -> GcResult<usize> {
        env.for_each_alloc_context(|ctx| {
            ctx.retire();
        })?;

        let found = {
            let roots = self.roots.lock();
            let mut queues = self.finalization.lock();
            let registered = std::mem::take(&mut queues.registered);
            let (live, dead): (Vec<_>, Vec<_>) =
                registered.into_iter().partition(|obj| roots.contains(obj));
            queues.registered = live;
            let found = dead.len();
            queues.ready.extend(dead);
            found
        };

        // Everything allocated so far is now old
        let (next, end) = {
            let state = self.state.lock();
            (state.next, self.arena.end())
        };
        env.stomp_write_barrier(WriteBarrierParameters::suspended(
            WriteBarrierOp::StompEphemeral { low: next, high: end },
        ))?;
        Ok(found)
    }
}

impl Collector for ArenaHeap {
    fn initialize(&self, env: &GcEnv) -> GcResult<()> {
        *self.env.lock() = env.weak();
        let lowest = self.arena.start();
        let highest = self.state.lock().committed;
        env.stomp_write_barrier(WriteBarrierParameters::running(WriteBarrierOp::Initialize {
            card_table: Arc::new(CardTable::new(lowest, highest)),
            lowest,
            highest,
            ephemeral_low: lowest,
            ephemeral_high: self.arena.end(),
        }))
    }

    fn allocate(&self, ctx: &mut AllocContext, size: usize, flags: AllocFlags) -> Option<ObjectRef> {
        // Every handed-out address stays host-word aligned
        let size = size.checked_next_multiple_of(HOST_ALIGN)?;
        let obj = if flags.is_user_old_heap() {
            let (start, grown) = self.reserve(size, true)?;
            if let Some(highest) = grown {
                self.publish_growth(highest);
            }
            ObjectRef::from_address(start)?
        } else if let Some(addr) = ctx.bump_to_limit(size) {
            ObjectRef::from_address(addr)?
        } else {
            let quantum = size.max(self.config.allocation_quantum).next_multiple_of(ARENA_ALIGN);
            let (start, grown) = self.reserve(quantum, false)?;
            if let Some(highest) = grown {
                self.publish_growth(highest);
            }
            ctx.retire();
            ctx.set_region(start, start + quantum);
            ObjectRef::from_address(ctx.bump_to_limit(size)?)?
        };

        if flags.contains(AllocFlags::FINALIZE) {
            self.finalization.lock().registered.push(obj);
        }
        Some(obj)
    }

    fn garbage_collect(
        &self,
        env: &GcEnv,
        generation: i32,
        low_memory: bool,
        mode: CollectionMode,
    ) -> GcResult<CollectionOutcome> {
        self.gc_requests.fetch_add(1, Ordering::Relaxed);
        if mode == CollectionMode::Optimized && self.finalization.lock().registered.is_empty() {
            tracing::trace!(target: "ee_gc::alloc", generation, "optimized collection skipped");
            return Ok(CollectionOutcome::Skipped);
        }

        env.suspend(SuspendReason::ForGC)?;
        let collected = self.collect_stopped(env);
        env.restart(collected.is_ok())?;
        let found = collected?;

        self.collections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "ee_gc::alloc", generation, low_memory, ?mode, found, "collection complete");
        if found > 0 {
            env.enable_finalization();
        }
        Ok(CollectionOutcome::Completed { finalizable: found })
    }

    fn get_next_finalizable(&self) -> Option<ObjectRef> {
        self.finalization.lock().ready.pop_front()
    }

    fn get_extra_finalization_work(&self) -> Vec<FinalizationWorkItem> {
        std::mem::take(&mut self.finalization.lock().extra_work)
    }

    fn set_finalization_run(&self, obj: ObjectRef) {
        if self.owns(obj) {
            // SAFETY: the object was carved out of this arena, which outlives it
            unsafe { obj.header() }.set_bits(HEADER_FINALIZER_RUN);
        }
    }

    fn register_for_finalization(&self, obj: ObjectRef) -> bool {
        if !self.owns(obj) {
            return false;
        }
        self.finalization.lock().registered.push(obj);
        true
    }

    fn publish_object(&self, _obj: ObjectRef) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}
