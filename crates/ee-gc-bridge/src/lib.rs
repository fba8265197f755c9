//! # EE/GC boundary
//!
//! The contract between a managed runtime's execution engine and its garbage
//! collector.
//!
//! ## Design
//!
//! - **Mode control**: every attached thread is cooperative (may touch the
//!   heap) or preemptive (may not); only the thread itself flips its flag
//! - **Allocation**: per-thread bump contexts, with large, finalizable and
//!   sampled allocations routed through the collector
//! - **Suspension**: one stop-the-world cycle at a time, threads are hijacked
//!   to their next safe point
//! - **Write barrier**: card table and heap bounds republished with
//!   table-before-bounds ordering
//! - **Finalization**: lazily started worker draining the collector's queue
//!
//! Everything hangs off a [`GcEnv`]; there is no global state.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod alloc_context;
pub mod allocator;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod entry;
pub mod env;
pub mod error;
pub mod events;
pub mod finalization;
pub mod heap;
pub mod layout;
pub mod mutator;
pub mod object;
pub mod registry;
pub mod safepoint;
pub mod sampling;
pub mod suspend;
pub mod thread;

pub use alloc_context::AllocContext;
pub use allocator::AllocationEngine;
pub use barrier::{
    BarrierView, CardTable, WriteBarrierOp, WriteBarrierParameters, WriteBarrierUpdater,
};
pub use collector::{
    CollectionMode, CollectionOutcome, Collector, FinalizationWorkItem, MAX_GENERATION,
};
pub use config::{GcConfig, MemoryModel};
pub use env::{GcEnv, GcEnvBuilder};
pub use error::{GcError, GcResult};
pub use events::{EventSink, NoopEventSink, TracingEventSink};
pub use finalization::{FinalizationBridge, FinalizerStats};
pub use heap::{ArenaConfig, ArenaHeap};
pub use layout::PointerWidth;
pub use mutator::{MutatorThread, NoGcRegion};
pub use object::{AllocFlags, ObjectRef, TypeDescriptor};
pub use safepoint::{Checkin, PollingHijack, SafepointCapability};
pub use sampling::{AllocationSample, AllocationSampler};
pub use suspend::{SuspendPhase, SuspendReason, SuspensionCoordinator};
pub use thread::{GcMode, ThreadRecord};
