//! Runtime environment
//!
//! A `GcEnv` owns everything one runtime instance shares between threads.
//! It is always held in an `Arc`; attached threads and the finalizer worker
//! keep it alive.

use crate::alloc_context::AllocContext;
use crate::allocator::AllocationEngine;
use crate::barrier::{BarrierView, WriteBarrierParameters, WriteBarrierUpdater};
use crate::collector::{CollectionMode, CollectionOutcome, Collector, MAX_GENERATION};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::events::{EventSink, NoopEventSink};
use crate::finalization::FinalizationBridge;
use crate::layout::PointerWidth;
use crate::mutator::MutatorThread;
use crate::object::ObjectRef;
use crate::registry::ThreadRegistry;
use crate::safepoint::{PollingHijack, SafepointCapability};
use crate::suspend::{SuspendReason, SuspensionCoordinator};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared state of one runtime instance
pub struct GcEnv {
    config: GcConfig,
    registry: ThreadRegistry,
    coordinator: SuspensionCoordinator,
    barrier: WriteBarrierUpdater,
    allocator: AllocationEngine,
    finalizer: FinalizationBridge,
    collector: Arc<dyn Collector>,
    events: Arc<dyn EventSink>,
    self_ref: Weak<GcEnv>,
}

/// Builder for [`GcEnv`]
pub struct GcEnvBuilder {
    collector: Arc<dyn Collector>,
    config: GcConfig,
    events: Arc<dyn EventSink>,
    safepoint: Arc<dyn SafepointCapability>,
    pointer_width: PointerWidth,
}

impl GcEnvBuilder {
    /// Use `config`
    pub fn config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// Report runtime events to `events`
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Use a platform-specific hijack mechanism
    pub fn safepoint(mut self, safepoint: Arc<dyn SafepointCapability>) -> Self {
        self.safepoint = safepoint;
        self
    }

    /// Compute object sizes for a different target width
    pub fn pointer_width(mut self, width: PointerWidth) -> Self {
        self.pointer_width = width;
        self
    }

    /// Build the environment and let the collector initialize against it
    pub fn build(self) -> GcResult<Arc<GcEnv>> {
        let Self {
            collector,
            config,
            events,
            safepoint,
            pointer_width,
        } = self;
        let allocator = AllocationEngine::new(&config, collector.large_object_threshold(), pointer_width);
        let env = Arc::new_cyclic(|weak| GcEnv {
            registry: ThreadRegistry::new(),
            coordinator: SuspensionCoordinator::new(&config, safepoint, events.clone()),
            barrier: WriteBarrierUpdater::new(config.memory_model),
            finalizer: FinalizationBridge::new(&config),
            allocator,
            collector,
            events,
            config,
            self_ref: weak.clone(),
        });
        env.collector.initialize(&env)?;
        tracing::debug!(
            target: "ee_gc::threads",
            large_object_threshold = env.allocator.large_object_threshold(),
            memory_model = ?env.config.memory_model,
            "environment ready"
        );
        Ok(env)
    }
}

impl GcEnv {
    /// Start building an environment around `collector`
    pub fn builder(collector: Arc<dyn Collector>) -> GcEnvBuilder {
        GcEnvBuilder {
            collector,
            config: GcConfig::default(),
            events: Arc::new(NoopEventSink),
            safepoint: Arc::new(PollingHijack),
            pointer_width: PointerWidth::native(),
        }
    }

    /// Get config
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Attached threads
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Stop-the-world coordinator
    pub fn coordinator(&self) -> &SuspensionCoordinator {
        &self.coordinator
    }

    /// Write barrier state
    pub fn barrier(&self) -> &WriteBarrierUpdater {
        &self.barrier
    }

    /// Allocation policy
    pub fn allocator(&self) -> &AllocationEngine {
        &self.allocator
    }

    /// Finalizer thread bridge
    pub fn finalizer(&self) -> &FinalizationBridge {
        &self.finalizer
    }

    /// The collector
    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }

    /// Event observer
    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Weak handle to this environment
    pub fn weak(&self) -> Weak<GcEnv> {
        self.self_ref.clone()
    }

    fn strong(&self) -> GcResult<Arc<GcEnv>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| GcError::invariant("environment is being torn down"))
    }

    /// Attach the calling OS thread. It starts in preemptive mode.
    pub fn attach_current_thread(&self, name: Option<String>) -> GcResult<MutatorThread> {
        let env = self.strong()?;
        let record = self.registry.attach(name, false)?;
        Ok(MutatorThread::new(env, record))
    }

    /// Attach the calling OS thread as a collector worker. Suspension leaves
    /// it running.
    pub fn attach_gc_worker(&self, name: Option<String>) -> GcResult<MutatorThread> {
        let env = self.strong()?;
        let record = self.registry.attach(name, true)?;
        Ok(MutatorThread::new(env, record))
    }

    /// Stop the world
    pub fn suspend(&self, reason: SuspendReason) -> GcResult<()> {
        self.coordinator.suspend(&self.registry, reason)
    }

    /// Restart the world stopped by the calling thread
    pub fn restart(&self, finished_gc: bool) -> GcResult<()> {
        self.coordinator.restart(&self.registry, finished_gc)
    }

    /// Whether every mutator is parked; never blocks
    pub fn is_world_stopped(&self) -> bool {
        self.coordinator.is_world_stopped()
    }

    /// Visit every mutator's allocation context. Collector worker threads are
    /// excluded since they keep running.
    ///
    /// Only the suspending thread of a stopped world may call this.
    pub fn for_each_alloc_context(&self, mut f: impl FnMut(&mut AllocContext)) -> GcResult<()> {
        self.coordinator.require_stopped_by_current()?;
        self.registry.for_each(|thread| {
            if thread.is_gc_special() {
                return;
            }
            // SAFETY: every owner is parked or is the caller, which holds no
            // borrow of its own context while collecting
            f(unsafe { thread.alloc_context_mut() });
        });
        Ok(())
    }

    /// Apply a write barrier update
    pub fn stomp_write_barrier(&self, params: WriteBarrierParameters) -> GcResult<()> {
        self.barrier.stomp(&self.coordinator, params)
    }

    /// Barrier globals in barrier order; callable from any thread
    pub fn barrier_view(&self) -> BarrierView {
        self.barrier.view()
    }

    /// Request a collection
    pub fn collect(
        &self,
        generation: i32,
        low_memory: bool,
        mode: CollectionMode,
    ) -> GcResult<CollectionOutcome> {
        if !(0..=MAX_GENERATION).contains(&generation) {
            return Err(GcError::invariant(format!("no generation {generation}")));
        }
        if let Some(thread) = self.registry.current() {
            if thread.in_no_gc_region() {
                return Err(GcError::invariant("collection requested inside a no-GC region"));
            }
        }
        self.collector
            .garbage_collect(self, generation, low_memory, mode)
    }

    /// Allow the finalizer thread to start
    pub fn initialize_finalizer(&self) -> bool {
        self.finalizer.initialize(self)
    }

    /// Wake the finalizer thread: the collector queued work
    pub fn enable_finalization(&self) {
        self.finalizer.enable(self);
    }

    /// Ask the finalizer thread to run a low-memory collection
    pub fn signal_memory_pressure(&self) -> bool {
        self.finalizer.signal_memory_pressure(self)
    }

    /// Wait until the finalizers pending now have run
    pub fn wait_for_pending_finalizers(
        &self,
        allow_reentrant: bool,
        timeout: Option<Duration>,
    ) -> GcResult<bool> {
        self.finalizer.wait_for_pending(self, allow_reentrant, timeout)
    }

    /// Next object whose finalizer must run
    pub fn get_next_finalizable(&self) -> Option<ObjectRef> {
        self.finalizer.next_finalizable(self)
    }

    /// Announce a drain completed outside the worker
    pub fn signal_finalization_complete(&self) {
        self.finalizer.signal_finalization_complete();
    }

    /// Suppress the finalizer of `obj`
    pub fn suppress_finalize(&self, obj: ObjectRef) {
        self.finalizer.suppress(self, obj);
    }

    /// Re-enable the finalizer of `obj`
    ///
    /// # Safety
    /// `obj` must be a live object allocated in this environment.
    pub unsafe fn reregister_for_finalize(&self, obj: ObjectRef) -> bool {
        // SAFETY: forwarded to the caller
        unsafe { self.finalizer.reregister(self, obj) }
    }
}

impl std::fmt::Debug for GcEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcEnv")
            .field("threads", &self.registry.len())
            .field("phase", &self.coordinator.phase())
            .field("barrier_initialized", &self.barrier.is_initialized())
            .finish_non_exhaustive()
    }
}
