//! Stop-the-world suspension
//!
//! ## Protocol
//!
//! - `suspend()` takes the suspension lock (one cycle in flight at a time),
//!   raises the trap-returning-threads flag and fences
//! - every cooperative, non-GC-special thread is asked to check in through the
//!   [`SafepointCapability`]; threads caught at an unreportable point are
//!   retried on the next round
//! - the coordinator alternates between observe-only spinning (while threads
//!   keep parking) and waiting on the parked-thread event with a ping timeout
//! - `restart()` fences on weak memory models, runs deferred cleanup, removes
//!   hijacks, drops the trap, wakes parked threads and releases the lock
//!
//! A mutator that sees the trap while entering cooperative mode backs out,
//! reports in and waits for the restart.

use crate::config::{GcConfig, MemoryModel};
use crate::error::{GcError, GcResult, fail_fast};
use crate::events::EventSink;
use crate::registry::ThreadRegistry;
use crate::safepoint::{Checkin, SafepointCapability};
use crate::thread::ThreadRecord;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering, fence};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Why the runtime is being suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// A garbage collection
    ForGC,
    /// Preparation work ahead of a garbage collection
    ForGCPrep,
    /// Debugger break
    ForDebugger,
    /// Debugger sweep of all threads
    ForDebuggerSweep,
    /// Runtime shutdown
    ForShutdown,
    /// Any other non-GC reason
    Other,
}

impl SuspendReason {
    /// Whether the reason is collector-driven
    pub fn is_gc(self) -> bool {
        matches!(self, SuspendReason::ForGC | SuspendReason::ForGCPrep)
    }
}

/// Phase of the current suspension cycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPhase {
    /// No cycle in flight
    Idle = 0,
    /// Lock taken, threads are being brought to rest
    Requesting = 1,
    /// Every mutator is parked
    WorldStopped = 2,
}

impl From<u8> for SuspendPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => SuspendPhase::Requesting,
            2 => SuspendPhase::WorldStopped,
            _ => SuspendPhase::Idle,
        }
    }
}

/// Suspension statistics
#[derive(Debug, Default, Clone)]
pub struct SuspensionStats {
    /// Completed suspension cycles
    pub cycles: u64,
    /// Hijacks planted
    pub hijacks: u64,
    /// Check-ins that came back `NotYetSafe`
    pub retries: u64,
    /// Time from lock acquisition to world stopped, worst case (nanoseconds)
    pub max_suspend_ns: u64,
    /// Time from world stopped to restart, worst case (nanoseconds)
    pub max_pause_ns: u64,
}

struct CycleState {
    phase: SuspendPhase,
    suspender: Option<ThreadId>,
    reason: Option<SuspendReason>,
    stopped_at: Option<Instant>,
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Global stop-the-world coordinator
pub struct SuspensionCoordinator {
    /// The suspension lock: at most one cycle outside `Idle`
    cycle: Mutex<CycleState>,
    cycle_released: Condvar,
    /// Lock-free mirror of the cycle phase
    phase: AtomicU8,
    trap_returning_threads: CachePadded<AtomicBool>,
    gc_in_progress: AtomicBool,
    /// Record id of the suspending thread (0 when none or not attached)
    suspender_record: AtomicU64,
    parked: Mutex<u64>,
    parked_cv: Condvar,
    restart_epoch: Mutex<u64>,
    restarted_cv: Condvar,
    deferred: Mutex<Vec<Cleanup>>,
    stopped_worlds: AtomicUsize,
    stats: Mutex<SuspensionStats>,
    capability: Arc<dyn SafepointCapability>,
    events: Arc<dyn EventSink>,
    ping_timeout: Duration,
    deadlock_timeout: Option<Duration>,
    memory_model: MemoryModel,
}

/// Cross-processor write-buffer flush.
///
/// A sequentially consistent fence orders this thread's trap/bounds stores
/// against the mutators' SeqCst mode-flag accesses.
pub fn flush_process_write_buffers() {
    fence(Ordering::SeqCst);
}

impl SuspensionCoordinator {
    /// Create a coordinator
    pub fn new(
        config: &GcConfig,
        capability: Arc<dyn SafepointCapability>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cycle: Mutex::new(CycleState {
                phase: SuspendPhase::Idle,
                suspender: None,
                reason: None,
                stopped_at: None,
            }),
            cycle_released: Condvar::new(),
            phase: AtomicU8::new(SuspendPhase::Idle as u8),
            trap_returning_threads: CachePadded::new(AtomicBool::new(false)),
            gc_in_progress: AtomicBool::new(false),
            suspender_record: AtomicU64::new(0),
            parked: Mutex::new(0),
            parked_cv: Condvar::new(),
            restart_epoch: Mutex::new(0),
            restarted_cv: Condvar::new(),
            deferred: Mutex::new(Vec::new()),
            stopped_worlds: AtomicUsize::new(0),
            stats: Mutex::new(SuspensionStats::default()),
            capability,
            events,
            ping_timeout: config.suspend_ping_timeout,
            deadlock_timeout: config.suspend_deadlock_timeout,
            memory_model: config.memory_model,
        }
    }

    /// Current phase; never blocks
    pub fn phase(&self) -> SuspendPhase {
        SuspendPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Whether every mutator is parked
    pub fn is_world_stopped(&self) -> bool {
        self.phase() == SuspendPhase::WorldStopped
    }

    /// Whether a suspension cycle is in flight
    pub fn is_gc_in_progress(&self) -> bool {
        self.gc_in_progress.load(Ordering::SeqCst)
    }

    /// Whether threads entering cooperative mode must stop
    pub fn is_trapping(&self) -> bool {
        self.trap_returning_threads.load(Ordering::SeqCst)
    }

    /// Number of cycles currently in `WorldStopped` (0 or 1)
    pub fn stopped_worlds(&self) -> usize {
        self.stopped_worlds.load(Ordering::SeqCst)
    }

    /// Reason of the cycle in flight
    pub fn current_reason(&self) -> Option<SuspendReason> {
        self.cycle.lock().reason
    }

    /// Get statistics
    pub fn stats(&self) -> SuspensionStats {
        self.stats.lock().clone()
    }

    /// Whether `record` is the thread driving the current cycle
    pub fn is_suspending_thread(&self, record: &ThreadRecord) -> bool {
        self.suspender_record.load(Ordering::SeqCst) == record.id()
    }

    /// Fail unless the world is stopped and the caller is the suspending thread
    pub fn require_stopped_by_current(&self) -> GcResult<()> {
        let cycle = self.cycle.lock();
        if cycle.phase != SuspendPhase::WorldStopped {
            return Err(GcError::invariant("operation requires a stopped world"));
        }
        if cycle.suspender != Some(std::thread::current().id()) {
            return Err(GcError::invariant(
                "operation requires being the suspending thread",
            ));
        }
        Ok(())
    }

    /// Queue cleanup to run at the next restart, when no thread can be
    /// cooperative.
    pub fn defer(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.deferred.lock().push(Box::new(cleanup));
    }

    /// Number of queued cleanups
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Stop the world.
    ///
    /// Returns once every registered thread is preemptive or GC-special. The
    /// calling thread, if attached, is exempt and keeps its mode.
    pub fn suspend(&self, registry: &ThreadRegistry, reason: SuspendReason) -> GcResult<()> {
        let me = registry.current();
        self.acquire_cycle(me.as_deref(), reason)?;

        self.events.suspend_begin(reason);
        tracing::debug!(target: "ee_gc::suspend", ?reason, threads = registry.len(), "suspension starting");
        let start = Instant::now();

        self.gc_in_progress.store(true, Ordering::SeqCst);
        self.trap_returning_threads.store(true, Ordering::SeqCst);
        // Publish the trap before reading any mode flag
        flush_process_write_buffers();

        let hijacked = self.bring_threads_to_rest(registry, me.as_ref().map(|r| r.id()))?;

        if let Err(err) = self.claim_stopped_world() {
            fail_fast(&err);
        }
        {
            let mut cycle = self.cycle.lock();
            cycle.phase = SuspendPhase::WorldStopped;
            cycle.stopped_at = Some(Instant::now());
            self.phase
                .store(SuspendPhase::WorldStopped as u8, Ordering::Release);
        }

        let elapsed = start.elapsed().as_nanos() as u64;
        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.max_suspend_ns = stats.max_suspend_ns.max(elapsed);
        }
        tracing::debug!(
            target: "ee_gc::suspend",
            ?reason,
            hijacked,
            suspend_us = elapsed / 1000,
            "world stopped"
        );
        self.events.suspend_end(reason, hijacked);
        Ok(())
    }

    /// Count this cycle as the one holding the world stopped.
    fn claim_stopped_world(&self) -> GcResult<()> {
        if self.stopped_worlds.fetch_add(1, Ordering::SeqCst) != 0 {
            self.stopped_worlds.fetch_sub(1, Ordering::SeqCst);
            return Err(GcError::invariant(
                "two suspension cycles stopped the world at once",
            ));
        }
        Ok(())
    }

    /// Release the world stopped by the calling thread.
    pub fn restart(&self, registry: &ThreadRegistry, finished_gc: bool) -> GcResult<()> {
        let stopped_at = {
            let cycle = self.cycle.lock();
            if cycle.phase != SuspendPhase::WorldStopped {
                return Err(GcError::invariant("restart without a stopped world"));
            }
            if cycle.suspender != Some(std::thread::current().id()) {
                return Err(GcError::invariant(
                    "restart from a thread that did not suspend",
                ));
            }
            cycle.stopped_at
        };

        self.events.restart_begin();

        if self.memory_model.is_weak() {
            // Threads that ran preemptively during the stop must observe
            // every heap-bounds change before returning to cooperative mode
            flush_process_write_buffers();
        }

        self.run_deferred_cleanup();

        registry.for_each(|thread| self.capability.release(thread));

        self.stopped_worlds.fetch_sub(1, Ordering::SeqCst);
        self.gc_in_progress.store(false, Ordering::SeqCst);
        self.trap_returning_threads.store(false, Ordering::SeqCst);
        {
            let mut epoch = self.restart_epoch.lock();
            *epoch += 1;
            self.restarted_cv.notify_all();
        }

        if let Some(stopped_at) = stopped_at {
            let pause = stopped_at.elapsed().as_nanos() as u64;
            let mut stats = self.stats.lock();
            stats.max_pause_ns = stats.max_pause_ns.max(pause);
        }

        {
            let mut cycle = self.cycle.lock();
            cycle.phase = SuspendPhase::Idle;
            cycle.suspender = None;
            cycle.reason = None;
            cycle.stopped_at = None;
            self.phase.store(SuspendPhase::Idle as u8, Ordering::Release);
            self.suspender_record.store(0, Ordering::SeqCst);
            self.cycle_released.notify_all();
        }

        tracing::debug!(target: "ee_gc::suspend", finished_gc, "world restarted");
        self.events.restart_end(finished_gc);
        Ok(())
    }

    /// Take the suspension lock, parking an attached cooperative caller while
    /// it waits so an in-flight cycle is not blocked on it.
    fn acquire_cycle(&self, me: Option<&ThreadRecord>, reason: SuspendReason) -> GcResult<()> {
        let os_thread = std::thread::current().id();
        let parked_self = match me {
            Some(record) if record.is_cooperative() => {
                record.set_cooperative(false);
                self.notify_parked();
                true
            }
            _ => false,
        };

        let acquired = {
            let mut cycle = self.cycle.lock();
            if cycle.suspender == Some(os_thread) {
                Err(GcError::invariant(
                    "suspend re-entered by the suspending thread",
                ))
            } else {
                while cycle.phase != SuspendPhase::Idle {
                    self.cycle_released.wait(&mut cycle);
                }
                cycle.phase = SuspendPhase::Requesting;
                cycle.suspender = Some(os_thread);
                cycle.reason = Some(reason);
                self.phase
                    .store(SuspendPhase::Requesting as u8, Ordering::Release);
                self.suspender_record
                    .store(me.map_or(0, |r| r.id()), Ordering::SeqCst);
                Ok(())
            }
        };

        if parked_self {
            if let Some(record) = me {
                // The trap is down until we raise it, so this cannot block
                record.set_cooperative(true);
            }
        }
        acquired
    }

    fn bring_threads_to_rest(&self, registry: &ThreadRegistry, self_id: Option<u64>) -> GcResult<usize> {
        let mut pending: Vec<(Arc<ThreadRecord>, bool)> = registry
            .snapshot()
            .into_iter()
            .filter(|t| Some(t.id()) != self_id)
            .filter(|t| !t.is_gc_special())
            .filter(|t| t.is_cooperative())
            .map(|t| (t, false))
            .collect();

        let started = Instant::now();
        let backoff = Backoff::new();
        let mut previous = 0usize;
        let mut observe_only = false;
        let mut hijacked = 0usize;
        let mut retries = 0u64;

        loop {
            let seen = *self.parked.lock();

            pending.retain(|(thread, _)| {
                let still_coop = thread.is_cooperative();
                if !still_coop {
                    tracing::trace!(target: "ee_gc::suspend", id = thread.id(), "thread parked");
                }
                still_coop
            });
            if pending.is_empty() {
                break;
            }

            if !observe_only {
                for (thread, redirected) in pending.iter_mut() {
                    if *redirected {
                        continue;
                    }
                    match self.capability.request_cooperative_checkin(thread) {
                        Checkin::Reportable => {
                            *redirected = true;
                            hijacked += 1;
                            tracing::trace!(target: "ee_gc::suspend", id = thread.id(), "hijack planted");
                        }
                        Checkin::NotYetSafe => {
                            retries += 1;
                        }
                    }
                }
            }

            let progress = pending.len() != previous;
            previous = pending.len();
            if progress || !observe_only {
                backoff.snooze();
                observe_only = true;
                continue;
            }

            {
                let mut parked = self.parked.lock();
                if *parked == seen {
                    self.parked_cv.wait_for(&mut parked, self.ping_timeout);
                }
            }
            observe_only = false;

            if let Some(limit) = self.deadlock_timeout {
                if started.elapsed() > limit {
                    let ids: Vec<u64> = pending.iter().map(|(t, _)| t.id()).collect();
                    tracing::error!(target: "ee_gc::suspend", ?ids, "threads refuse to reach a safe point");
                    return Err(GcError::suspension(format!(
                        "threads {ids:?} did not reach a safe point within {limit:?}"
                    )));
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.hijacks += hijacked as u64;
        stats.retries += retries;
        if retries > 0 {
            tracing::warn!(target: "ee_gc::suspend", retries, "check-ins had to be retried");
        }
        Ok(hijacked)
    }

    fn run_deferred_cleanup(&self) {
        let cleanups = std::mem::take(&mut *self.deferred.lock());
        if !cleanups.is_empty() {
            tracing::trace!(target: "ee_gc::suspend", count = cleanups.len(), "running deferred cleanup");
        }
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Wake the coordinator: a thread just left cooperative mode.
    pub(crate) fn notify_parked(&self) {
        let mut parked = self.parked.lock();
        *parked += 1;
        self.parked_cv.notify_all();
    }

    /// Block until the current cycle restarts.
    pub(crate) fn wait_for_restart(&self) {
        let mut epoch = self.restart_epoch.lock();
        while self.trap_returning_threads.load(Ordering::SeqCst) {
            self.restarted_cv.wait(&mut epoch);
        }
    }
}
