//! Finalizer thread
//!
//! The collector queues objects whose finalizer must run; a dedicated worker
//! drains that queue. The worker is started lazily, sleeps until work or
//! memory pressure is signalled, and announces every completed drain so
//! `wait_for_pending` callers can return.
//!
//! The worker only holds a weak reference to the environment while idle, so
//! dropping the last strong handle shuts it down.

use crate::collector::CollectionMode;
use crate::config::GcConfig;
use crate::env::GcEnv;
use crate::error::{GcError, GcResult};
use crate::mutator::{enter_cooperative, enter_preemptive};
use crate::object::{HEADER_FINALIZER_RUN, ObjectRef};
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Name given to the worker thread
pub const FINALIZER_THREAD_NAME: &str = "ee-gc-finalizer";

/// Finalizer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FinalizerStats {
    /// Finalizers run
    pub finalized: u64,
    /// Suppressed objects skipped
    pub skipped: u64,
    /// Auxiliary work items run
    pub work_items: u64,
    /// Finalizers that panicked
    pub panicked: u64,
    /// Completed drains
    pub drains: u64,
    /// Collections triggered by memory pressure
    pub pressure_collections: u64,
}

#[derive(Default)]
struct BridgeState {
    initialized: bool,
    started: bool,
    shutdown: bool,
    work_requested: bool,
    memory_pressure: bool,
    cooldown_until: Option<Instant>,
    draining: bool,
    completed_drains: u64,
}

struct Shared {
    state: Mutex<BridgeState>,
    work_cv: Condvar,
    done_cv: Condvar,
    worker_thread: Mutex<Option<ThreadId>>,
    finalized: AtomicU64,
    skipped: AtomicU64,
    work_items: AtomicU64,
    panicked: AtomicU64,
    pressure_collections: AtomicU64,
    cooldown: Duration,
    idle_timeout: Option<Duration>,
}

/// Bridge between the collector's finalization queue and the worker thread
pub struct FinalizationBridge {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizationBridge {
    /// Create an idle bridge
    pub fn new(config: &GcConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState::default()),
                work_cv: Condvar::new(),
                done_cv: Condvar::new(),
                worker_thread: Mutex::new(None),
                finalized: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                work_items: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                pressure_collections: AtomicU64::new(0),
                cooldown: config.finalizer_pressure_cooldown,
                idle_timeout: config.finalizer_idle_timeout,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Allow the worker to start. Returns false after shutdown.
    pub fn initialize(&self, env: &GcEnv) -> bool {
        let pending = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return false;
            }
            state.initialized = true;
            state.work_requested || state.memory_pressure
        };
        tracing::debug!(target: "ee_gc::finalizer", pending, "finalizer initialized");
        if pending {
            self.ensure_worker(env);
        }
        true
    }

    /// Whether the worker thread is running
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Whether the caller is the worker thread
    pub fn is_worker_thread(&self) -> bool {
        *self.shared.worker_thread.lock() == Some(std::thread::current().id())
    }

    /// Get statistics
    pub fn stats(&self) -> FinalizerStats {
        let shared = &self.shared;
        FinalizerStats {
            finalized: shared.finalized.load(Ordering::Relaxed),
            skipped: shared.skipped.load(Ordering::Relaxed),
            work_items: shared.work_items.load(Ordering::Relaxed),
            panicked: shared.panicked.load(Ordering::Relaxed),
            drains: shared.state.lock().completed_drains,
            pressure_collections: shared.pressure_collections.load(Ordering::Relaxed),
        }
    }

    /// Signal that the collector has queued finalization work
    pub fn enable(&self, env: &GcEnv) {
        {
            let mut state = self.shared.state.lock();
            state.work_requested = true;
            self.shared.work_cv.notify_all();
        }
        self.ensure_worker(env);
    }

    /// Signal memory pressure; ignored during the cool-down
    pub fn signal_memory_pressure(&self, env: &GcEnv) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state
                .cooldown_until
                .is_some_and(|until| Instant::now() < until)
            {
                tracing::trace!(target: "ee_gc::finalizer", "memory pressure ignored during cool-down");
                return false;
            }
            state.memory_pressure = true;
            self.shared.work_cv.notify_all();
        }
        self.ensure_worker(env);
        true
    }

    /// Block until every finalizer pending at the time of the call has run.
    ///
    /// Returns `Ok(false)` on timeout. The worker thread itself may only call
    /// this with `allow_reentrant`, in which case it returns immediately.
    pub fn wait_for_pending(
        &self,
        env: &GcEnv,
        allow_reentrant: bool,
        timeout: Option<Duration>,
    ) -> GcResult<bool> {
        if self.is_worker_thread() {
            if allow_reentrant {
                return Ok(true);
            }
            return Err(GcError::invariant(
                "finalizer thread waited for its own queue",
            ));
        }

        let target = {
            let mut state = self.shared.state.lock();
            if !state.initialized || state.shutdown {
                // No worker will ever run
                return Ok(true);
            }
            state.work_requested = true;
            self.shared.work_cv.notify_all();
            // A drain in flight may have missed objects queued before this call
            state.completed_drains + if state.draining { 2 } else { 1 }
        };
        self.ensure_worker(env);

        // Park an attached cooperative caller so collections can proceed
        let record = env.registry().current().filter(|r| r.is_cooperative());
        if let Some(record) = &record {
            enter_preemptive(env.coordinator(), record);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let reached = {
            let mut state = self.shared.state.lock();
            loop {
                if state.completed_drains >= target {
                    break true;
                }
                if state.shutdown {
                    break false;
                }
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .done_cv
                            .wait_until(&mut state, deadline)
                            .timed_out()
                        {
                            break state.completed_drains >= target;
                        }
                    }
                    None => self.shared.done_cv.wait(&mut state),
                }
            }
        };

        if let Some(record) = &record {
            enter_cooperative(env.coordinator(), record);
        }
        if !reached {
            tracing::debug!(target: "ee_gc::finalizer", ?timeout, "wait for pending finalizers timed out");
        }
        Ok(reached)
    }

    /// Record a drain completed by an external driver
    pub fn signal_finalization_complete(&self) {
        let mut state = self.shared.state.lock();
        state.completed_drains += 1;
        self.shared.done_cv.notify_all();
    }

    /// Next object whose finalizer must run. Suppressed objects are skipped
    /// and have their bit cleared.
    pub fn next_finalizable(&self, env: &GcEnv) -> Option<ObjectRef> {
        next_live_finalizable(env, &self.shared)
    }

    /// Mark `obj` as not needing finalization
    pub fn suppress(&self, env: &GcEnv, obj: ObjectRef) {
        env.collector().set_finalization_run(obj);
    }

    /// Undo a suppression, or queue `obj` again if it was not suppressed.
    ///
    /// # Safety
    /// `obj` must be a live object allocated in `env`.
    pub unsafe fn reregister(&self, env: &GcEnv, obj: ObjectRef) -> bool {
        // SAFETY: forwarded to the caller
        let header = unsafe { obj.header() };
        if header.is_finalizer_run() {
            header.clear_bits(HEADER_FINALIZER_RUN);
            true
        } else {
            env.collector().register_for_finalization(obj)
        }
    }

    /// Stop the worker and wait for it, unless called from the worker itself.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.work_cv.notify_all();
            self.shared.done_cv.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(target: "ee_gc::finalizer", "finalizer thread panicked");
            }
        }
        tracing::debug!(target: "ee_gc::finalizer", "finalizer shut down");
    }

    fn ensure_worker(&self, env: &GcEnv) {
        {
            let mut state = self.shared.state.lock();
            if !state.initialized || state.started || state.shutdown {
                return;
            }
            state.started = true;
        }

        let shared = self.shared.clone();
        let weak = env.weak();
        let spawned = std::thread::Builder::new()
            .name(FINALIZER_THREAD_NAME.into())
            .spawn(move || run_worker(shared, weak));
        match spawned {
            Ok(handle) => {
                *self.shared.worker_thread.lock() = Some(handle.thread().id());
                *self.worker.lock() = Some(handle);
                tracing::debug!(target: "ee_gc::finalizer", "finalizer thread started");
            }
            Err(err) => {
                self.shared.state.lock().started = false;
                tracing::error!(target: "ee_gc::finalizer", %err, "failed to start finalizer thread");
            }
        }
    }
}

impl Drop for FinalizationBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Wake {
    Drain { pressure: bool },
    Exit,
}

fn wait_for_work(shared: &Shared) -> Wake {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return Wake::Exit;
        }
        if state.memory_pressure || state.work_requested {
            break;
        }
        match shared.idle_timeout {
            Some(idle) => {
                if shared.work_cv.wait_for(&mut state, idle).timed_out() {
                    break;
                }
            }
            None => shared.work_cv.wait(&mut state),
        }
    }
    let pressure = std::mem::take(&mut state.memory_pressure);
    state.work_requested = false;
    state.draining = true;
    Wake::Drain { pressure }
}

fn run_worker(shared: Arc<Shared>, env: Weak<GcEnv>) {
    *shared.worker_thread.lock() = Some(std::thread::current().id());
    loop {
        let pressure = match wait_for_work(&shared) {
            Wake::Exit => break,
            Wake::Drain { pressure } => pressure,
        };
        let Some(env) = env.upgrade() else {
            break;
        };

        if pressure {
            react_to_pressure(&env, &shared);
        }
        let (finalized, skipped) = drain(&env, &shared);

        {
            let mut state = shared.state.lock();
            state.draining = false;
            state.completed_drains += 1;
            shared.done_cv.notify_all();
        }
        env.events().finalizer_drained(finalized, skipped);
        tracing::trace!(target: "ee_gc::finalizer", finalized, skipped, "drain complete");
    }

    let mut state = shared.state.lock();
    state.draining = false;
    shared.done_cv.notify_all();
}

fn react_to_pressure(env: &GcEnv, shared: &Shared) {
    tracing::debug!(target: "ee_gc::finalizer", "memory pressure, collecting gen0");
    if let Err(err) = env.collect(0, true, CollectionMode::Optimized) {
        tracing::warn!(target: "ee_gc::finalizer", %err, "pressure collection failed");
    }
    shared.pressure_collections.fetch_add(1, Ordering::Relaxed);
    shared.state.lock().cooldown_until = Some(Instant::now() + shared.cooldown);
}

fn drain(env: &GcEnv, shared: &Shared) -> (usize, usize) {
    let thread = match env.attach_current_thread(Some(FINALIZER_THREAD_NAME.into())) {
        Ok(thread) => thread,
        Err(err) => {
            tracing::error!(target: "ee_gc::finalizer", %err, "finalizer thread could not attach");
            return (0, 0);
        }
    };

    for item in env.collector().get_extra_finalization_work() {
        tracing::trace!(target: "ee_gc::finalizer", label = item.label, "running finalization work item");
        if catch_unwind(AssertUnwindSafe(item.callback)).is_err() {
            tracing::warn!(target: "ee_gc::finalizer", label = item.label, "finalization work item panicked");
        }
        shared.work_items.fetch_add(1, Ordering::Relaxed);
    }

    let skipped_before = shared.skipped.load(Ordering::Relaxed);
    let mut finalized = 0usize;
    thread.enter_cooperative();
    while let Some(obj) = next_live_finalizable(env, shared) {
        // SAFETY: queued objects stay live until their finalizer has run
        let desc = unsafe { obj.type_descriptor() };
        if let Some(finalizer) = desc.and_then(|d| d.finalizer) {
            match catch_unwind(AssertUnwindSafe(|| finalizer(obj))) {
                Ok(()) => {
                    finalized += 1;
                    shared.finalized.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    shared.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target: "ee_gc::finalizer",
                        object = ?obj,
                        ty = desc.map(|d| d.name),
                        "finalizer panicked"
                    );
                }
            }
        }
        thread.poll();
    }
    thread.enter_preemptive();
    drop(thread);

    let skipped = shared.skipped.load(Ordering::Relaxed) - skipped_before;
    (finalized, skipped as usize)
}

fn next_live_finalizable(env: &GcEnv, shared: &Shared) -> Option<ObjectRef> {
    loop {
        let obj = env.collector().get_next_finalizable()?;
        // SAFETY: queued objects stay live until their finalizer has run
        let header = unsafe { obj.header() };
        if header.is_finalizer_run() {
            header.clear_bits(HEADER_FINALIZER_RUN);
            shared.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        return Some(obj);
    }
}
