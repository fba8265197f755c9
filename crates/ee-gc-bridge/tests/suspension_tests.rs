//! Stop-the-world tests
//!
//! Mutators here are real OS threads spinning in cooperative mode and polling,
//! the way compiled code would.

use ee_gc_bridge::{
    ArenaHeap, EventSink, GcConfig, GcEnv, GcError, MutatorThread, SuspendPhase, SuspendReason,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

fn env_with(config: GcConfig) -> Arc<GcEnv> {
    let heap = Arc::new(ArenaHeap::new().unwrap());
    GcEnv::builder(heap).config(config).build().unwrap()
}

fn env() -> Arc<GcEnv> {
    env_with(GcConfig::default())
}

/// Spawn a cooperative thread that spins and polls until `stop`
fn spawn_spinner(env: &Arc<GcEnv>, stop: &Arc<AtomicBool>, progress: &Arc<AtomicU64>) -> JoinHandle<()> {
    let env = env.clone();
    let stop = stop.clone();
    let progress = progress.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let thread = env.attach_current_thread(Some("spinner".into())).unwrap();
        thread.enter_cooperative();
        ready_tx.send(()).unwrap();
        while !stop.load(Ordering::Relaxed) {
            progress.fetch_add(1, Ordering::Relaxed);
            thread.poll();
            std::hint::spin_loop();
        }
        thread.enter_preemptive();
    });
    ready_rx.recv().unwrap();
    handle
}

#[derive(Default)]
struct SuspendLog {
    hijacked: Mutex<Vec<usize>>,
    restarts: AtomicUsize,
}

impl EventSink for SuspendLog {
    fn suspend_end(&self, _reason: SuspendReason, hijacked: usize) {
        self.hijacked.lock().push(hijacked);
    }

    fn restart_end(&self, _finished_gc: bool) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_no_cooperative_thread_after_suspend() {
    let env = env();
    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicU64::new(0));
    let spinners: Vec<_> = (0..3).map(|_| spawn_spinner(&env, &stop, &progress)).collect();

    for _ in 0..25 {
        env.suspend(SuspendReason::ForGC).unwrap();
        assert_eq!(env.coordinator().phase(), SuspendPhase::WorldStopped);
        for thread in env.registry().snapshot() {
            assert!(!thread.is_cooperative(), "{thread:?} still cooperative");
        }
        // Parked threads make no progress
        let frozen = progress.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(progress.load(Ordering::Relaxed), frozen);
        env.restart(true).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for spinner in spinners {
        spinner.join().unwrap();
    }
    assert_eq!(env.coordinator().stats().cycles, 25);
}

#[test]
fn test_suspend_serializes_through_restart() {
    let env = env();
    let stopped_worlds = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let suspenders: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            let stopped_worlds = stopped_worlds.clone();
            let max_seen = max_seen.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    env.suspend(SuspendReason::ForGC).unwrap();
                    let now = stopped_worlds.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    max_seen.fetch_max(env.coordinator().stopped_worlds(), Ordering::SeqCst);
                    std::thread::yield_now();
                    stopped_worlds.fetch_sub(1, Ordering::SeqCst);
                    env.restart(true).unwrap();
                }
            })
        })
        .collect();

    for s in suspenders {
        s.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(env.coordinator().stats().cycles, 200);
}

#[test]
fn test_second_suspender_waits_for_restart() {
    let env = env();
    let restarted = Arc::new(AtomicBool::new(false));

    env.suspend(SuspendReason::ForDebugger).unwrap();

    let second = {
        let env = env.clone();
        let restarted = restarted.clone();
        std::thread::spawn(move || {
            env.suspend(SuspendReason::ForGC).unwrap();
            let saw_restart = restarted.load(Ordering::SeqCst);
            assert_eq!(env.coordinator().current_reason(), Some(SuspendReason::ForGC));
            env.restart(true).unwrap();
            saw_restart
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(env.coordinator().current_reason(), Some(SuspendReason::ForDebugger));
    restarted.store(true, Ordering::SeqCst);
    env.restart(false).unwrap();

    assert!(second.join().unwrap());
}

#[test]
fn test_attached_suspender_keeps_running() {
    let env = env();
    let thread = env.attach_current_thread(Some("collector-driver".into())).unwrap();
    thread.enter_cooperative();

    env.suspend(SuspendReason::ForGC).unwrap();
    // The suspending thread is exempt and may re-enter cooperative freely
    assert!(thread.is_cooperative());
    thread.enter_preemptive();
    thread.enter_cooperative();
    thread.poll();
    assert!(thread.is_cooperative());
    env.restart(true).unwrap();
}

#[test]
fn test_reentrant_suspend_and_foreign_restart_rejected() {
    let env = env();
    env.suspend(SuspendReason::ForGC).unwrap();
    assert!(matches!(
        env.suspend(SuspendReason::ForGC),
        Err(GcError::InvariantViolation(_))
    ));

    let foreign = {
        let env = env.clone();
        std::thread::spawn(move || env.restart(true)).join().unwrap()
    };
    assert!(matches!(foreign, Err(GcError::InvariantViolation(_))));
    env.restart(true).unwrap();
}

#[test]
fn test_enter_cooperative_blocks_while_stopped() {
    let env = env();
    let entered = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let mutator = {
        let env = env.clone();
        let entered = entered.clone();
        std::thread::spawn(move || {
            let thread = env.attach_current_thread(None).unwrap();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            thread.enter_cooperative();
            entered.store(true, Ordering::SeqCst);
            thread.enter_preemptive();
        })
    };

    ready_rx.recv().unwrap();
    env.suspend(SuspendReason::ForGC).unwrap();
    go_tx.send(()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(!entered.load(Ordering::SeqCst));
    env.restart(true).unwrap();

    mutator.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
}

#[test]
fn test_hijacks_are_planted_and_released() {
    let log = Arc::new(SuspendLog::default());
    let env = GcEnv::builder(Arc::new(ArenaHeap::new().unwrap()))
        .events(log.clone())
        .build()
        .unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicU64::new(0));
    let spinners: Vec<_> = (0..2).map(|_| spawn_spinner(&env, &stop, &progress)).collect();

    env.suspend(SuspendReason::ForGC).unwrap();
    env.restart(true).unwrap();
    for thread in env.registry().snapshot() {
        assert!(!thread.is_hijacked());
    }

    stop.store(true, Ordering::Relaxed);
    for spinner in spinners {
        spinner.join().unwrap();
    }
    // Spinners that see the trap on their own park without a hijack
    let hijacked = log.hijacked.lock();
    assert_eq!(hijacked.len(), 1);
    assert!(hijacked[0] <= 2);
    assert_eq!(log.restarts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_preemptive_and_gc_worker_threads_keep_running() {
    let env = env();
    let stop = Arc::new(AtomicBool::new(false));
    let worker_progress = Arc::new(AtomicU64::new(0));
    let (ready_tx, ready_rx) = mpsc::channel();

    // A collector worker that never polls
    let worker = {
        let env = env.clone();
        let stop = stop.clone();
        let progress = worker_progress.clone();
        let ready_tx = ready_tx.clone();
        std::thread::spawn(move || {
            let thread = env.attach_gc_worker(Some("gc-worker".into())).unwrap();
            thread.enter_cooperative();
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Relaxed) {
                progress.fetch_add(1, Ordering::Relaxed);
                std::hint::spin_loop();
            }
            thread.enter_preemptive();
        })
    };
    // A thread blocked in a native call
    let native = {
        let env = env.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let thread: MutatorThread = env.attach_current_thread(None).unwrap();
            thread.enter_cooperative();
            thread.preemptive(|| {
                ready_tx.send(()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
            thread.enter_preemptive();
        })
    };
    ready_rx.recv().unwrap();
    ready_rx.recv().unwrap();

    env.suspend(SuspendReason::ForGC).unwrap();
    let before = worker_progress.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(5));
    assert!(worker_progress.load(Ordering::Relaxed) > before);
    assert_eq!(env.coordinator().stats().hijacks, 0);
    env.restart(true).unwrap();

    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();
    native.join().unwrap();
}

#[test]
fn test_non_reportable_region_is_retried() {
    let env = env();
    let (ready_tx, ready_rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));

    let mutator = {
        let env = env.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let thread = env.attach_current_thread(None).unwrap();
            thread.enter_cooperative();
            thread.non_reportable_region(|| {
                ready_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(30));
            });
            while !stop.load(Ordering::Relaxed) {
                thread.poll();
                std::hint::spin_loop();
            }
            thread.enter_preemptive();
        })
    };

    ready_rx.recv().unwrap();
    env.suspend(SuspendReason::ForGC).unwrap();
    assert!(env.coordinator().stats().retries > 0);
    env.restart(true).unwrap();

    stop.store(true, Ordering::Relaxed);
    mutator.join().unwrap();
}

#[test]
fn test_stuck_thread_is_a_suspension_failure() {
    let env = env_with(GcConfig {
        suspend_deadlock_timeout: Some(Duration::from_millis(50)),
        ..GcConfig::default()
    });
    let (ready_tx, ready_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let stuck = {
        let env = env.clone();
        std::thread::spawn(move || {
            let thread = env.attach_current_thread(None).unwrap();
            thread.enter_cooperative();
            thread.non_reportable_region(|| {
                ready_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
            // The cycle never completes; detaching would wait on it forever
            std::mem::forget(thread);
        })
    };

    ready_rx.recv().unwrap();
    let result = env.suspend(SuspendReason::ForGC);
    assert!(matches!(result, Err(GcError::SuspensionFailure(_))));
    release_tx.send(()).unwrap();
    stuck.join().unwrap();
}

#[test]
fn test_alloc_contexts_only_visible_to_suspender() {
    let env = env();
    assert!(matches!(
        env.for_each_alloc_context(|_| {}),
        Err(GcError::InvariantViolation(_))
    ));

    let _thread = env.attach_current_thread(None).unwrap();
    let worker = env.attach_gc_worker(None);
    assert!(matches!(worker, Err(GcError::InvariantViolation(_))));

    env.suspend(SuspendReason::ForGC).unwrap();
    let mut seen = 0;
    env.for_each_alloc_context(|ctx| {
        assert!(ctx.is_empty());
        seen += 1;
    })
    .unwrap();
    assert_eq!(seen, 1);
    env.restart(true).unwrap();
}
