//! Write barrier metadata
//!
//! Mutators read the card table and heap bounds on every reference store.
//! The collector replaces them wholesale when the heap grows. The update rule:
//!
//! - the new card table is published before the new bounds
//! - readers load the bounds (acquire) before the card table
//!
//! so a reader that sees a bound covering the new region always finds a card
//! table that covers it too. Replaced tables stay alive until the next restart.
//!
//! That lifetime only protects threads the restart waits for: cooperative,
//! non-GC-special mutators. Every other reader (GC-special threads, threads
//! that were never attached) goes through the updater lock with
//! [`WriteBarrierUpdater::view`] and [`WriteBarrierUpdater::record_store_pinned`].

use crate::config::MemoryModel;
use crate::error::{GcError, GcResult};
use crate::suspend::{SuspensionCoordinator, flush_process_write_buffers};
use parking_lot::Mutex;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// log2 of the card size
pub const CARD_SHIFT: u32 = 9;

/// Size of a card in bytes
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No recorded store
    Clean = 0,
    /// A reference was stored into the card
    Dirty = 1,
}

/// One byte per [`CARD_SIZE`] bytes of `[lowest, highest)`
pub struct CardTable {
    lowest: usize,
    highest: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a clean table covering `[lowest, highest)`
    pub fn new(lowest: usize, highest: usize) -> Self {
        let span = highest.saturating_sub(lowest);
        let cards = (0..span.div_ceil(CARD_SIZE))
            .map(|_| AtomicU8::new(CardState::Clean as u8))
            .collect();
        Self {
            lowest,
            highest,
            cards,
        }
    }

    /// Lowest covered address
    pub fn lowest(&self) -> usize {
        self.lowest
    }

    /// One past the highest covered address
    pub fn highest(&self) -> usize {
        self.highest
    }

    /// Number of cards
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers nothing
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Whether `addr` falls inside the table
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.lowest && addr < self.highest
    }

    fn card(&self, addr: usize) -> Option<&AtomicU8> {
        if !self.covers(addr) {
            return None;
        }
        self.cards.get((addr - self.lowest) >> CARD_SHIFT)
    }

    /// Mark the card containing `addr`; returns false when out of range
    pub fn mark_card(&self, addr: usize) -> bool {
        match self.card(addr) {
            Some(card) => {
                card.store(CardState::Dirty as u8, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Check if the card containing `addr` is dirty
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.card(addr)
            .is_some_and(|c| c.load(Ordering::Relaxed) == CardState::Dirty as u8)
    }

    /// Number of dirty cards
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CardState::Dirty as u8)
            .count()
    }

    /// Clear all cards
    pub fn clear(&self) {
        for card in self.cards.iter() {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("lowest", &format_args!("{:#x}", self.lowest))
            .field("highest", &format_args!("{:#x}", self.highest))
            .field("cards", &self.cards.len())
            .finish()
    }
}

/// Tagged barrier update
#[derive(Debug, Clone)]
pub enum WriteBarrierOp {
    /// First publication; at most once per environment
    Initialize {
        /// Card table covering the initial heap
        card_table: Arc<CardTable>,
        /// Lowest heap address
        lowest: usize,
        /// One past the highest heap address
        highest: usize,
        /// Lowest ephemeral address
        ephemeral_low: usize,
        /// One past the highest ephemeral address
        ephemeral_high: usize,
    },
    /// Heap grew: new card table and bounds
    StompResize {
        /// Replacement card table
        card_table: Arc<CardTable>,
        /// New lowest heap address
        lowest: usize,
        /// New highest heap address
        highest: usize,
    },
    /// Ephemeral range moved
    StompEphemeral {
        /// Lowest ephemeral address
        low: usize,
        /// One past the highest ephemeral address
        high: usize,
    },
    /// Start recording stores in a write-watch table
    SwitchToWriteWatch {
        /// Table to record into
        table: Arc<CardTable>,
    },
    /// Stop recording into the write-watch table
    SwitchToNonWriteWatch,
}

impl WriteBarrierOp {
    fn name(&self) -> &'static str {
        match self {
            WriteBarrierOp::Initialize { .. } => "initialize",
            WriteBarrierOp::StompResize { .. } => "stomp_resize",
            WriteBarrierOp::StompEphemeral { .. } => "stomp_ephemeral",
            WriteBarrierOp::SwitchToWriteWatch { .. } => "switch_to_write_watch",
            WriteBarrierOp::SwitchToNonWriteWatch => "switch_to_non_write_watch",
        }
    }
}

/// Barrier update request from the collector
#[derive(Debug, Clone)]
pub struct WriteBarrierParameters {
    /// What to change
    pub op: WriteBarrierOp,
    /// Caller's claim about the world state; checked against the coordinator
    pub is_runtime_suspended: bool,
}

impl WriteBarrierParameters {
    /// Request made while the world runs
    pub fn running(op: WriteBarrierOp) -> Self {
        Self {
            op,
            is_runtime_suspended: false,
        }
    }

    /// Request made by the suspending thread of a stopped world
    pub fn suspended(op: WriteBarrierOp) -> Self {
        Self {
            op,
            is_runtime_suspended: true,
        }
    }
}

/// Values read by the mutator store barrier
pub struct WriteBarrierGlobals {
    card_table: AtomicPtr<CardTable>,
    lowest_address: AtomicUsize,
    highest_address: AtomicUsize,
    ephemeral_low: AtomicUsize,
    ephemeral_high: AtomicUsize,
    write_watch: AtomicPtr<CardTable>,
}

impl WriteBarrierGlobals {
    fn new() -> Self {
        Self {
            card_table: AtomicPtr::new(ptr::null_mut()),
            lowest_address: AtomicUsize::new(0),
            highest_address: AtomicUsize::new(0),
            ephemeral_low: AtomicUsize::new(0),
            ephemeral_high: AtomicUsize::new(0),
            write_watch: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Record a store of `value` into the reference slot at `slot`.
    ///
    /// # Safety
    /// The caller must be an attached, cooperative, non-GC-special thread.
    /// Such a thread is stopped whenever a restart frees retired tables.
    pub unsafe fn record_store(&self, slot: usize, value: usize) {
        let lowest = self.lowest_address.load(Ordering::Acquire);
        let highest = self.highest_address.load(Ordering::Acquire);
        if slot < lowest || slot >= highest {
            return;
        }

        let ephemeral_low = self.ephemeral_low.load(Ordering::Relaxed);
        let ephemeral_high = self.ephemeral_high.load(Ordering::Relaxed);
        if value >= ephemeral_low && value < ephemeral_high {
            let table = self.card_table.load(Ordering::Acquire);
            // SAFETY: published tables live until a restart, and a restart
            // cannot run while this thread is cooperative
            if let Some(table) = unsafe { table.as_ref() } {
                table.mark_card(slot);
            }
        }

        let watch = self.write_watch.load(Ordering::Acquire);
        // SAFETY: as above
        if let Some(watch) = unsafe { watch.as_ref() } {
            watch.mark_card(slot);
        }
    }

    /// Read the globals in barrier order without locking.
    ///
    /// # Safety
    /// Same contract as [`record_store`](Self::record_store).
    pub unsafe fn view(&self) -> BarrierView {
        let lowest = self.lowest_address.load(Ordering::Acquire);
        let highest = self.highest_address.load(Ordering::Acquire);
        let table = self.card_table.load(Ordering::Acquire);
        // SAFETY: see `record_store`; the view copies plain values only
        let (table_lowest, table_highest) = match unsafe { table.as_ref() } {
            Some(t) => (t.lowest(), t.highest()),
            None => (0, 0),
        };
        BarrierView {
            lowest,
            highest,
            card_table_lowest: table_lowest,
            card_table_highest: table_highest,
            ephemeral_low: self.ephemeral_low.load(Ordering::Relaxed),
            ephemeral_high: self.ephemeral_high.load(Ordering::Relaxed),
            write_watch: !self.write_watch.load(Ordering::Acquire).is_null(),
        }
    }
}

/// Snapshot of the barrier globals, read in barrier order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierView {
    /// Lowest heap address
    pub lowest: usize,
    /// One past the highest heap address
    pub highest: usize,
    /// Range covered by the card table seen after the bounds
    pub card_table_lowest: usize,
    /// See `card_table_lowest`
    pub card_table_highest: usize,
    /// Lowest ephemeral address
    pub ephemeral_low: usize,
    /// One past the highest ephemeral address
    pub ephemeral_high: usize,
    /// Whether a write-watch table is active
    pub write_watch: bool,
}

impl BarrierView {
    /// Whether the card table covers the bounds
    pub fn is_consistent(&self) -> bool {
        self.highest == 0
            || (self.card_table_lowest <= self.lowest && self.card_table_highest >= self.highest)
    }
}

#[derive(Default)]
struct Published {
    card_table: Option<Arc<CardTable>>,
    write_watch: Option<Arc<CardTable>>,
}

/// Applies [`WriteBarrierParameters`] to the globals
pub struct WriteBarrierUpdater {
    globals: WriteBarrierGlobals,
    /// Keeps the published tables alive; also serializes updaters
    published: Mutex<Published>,
    initialized: AtomicBool,
    memory_model: MemoryModel,
}

impl WriteBarrierUpdater {
    /// Create an updater with empty globals
    pub fn new(memory_model: MemoryModel) -> Self {
        Self {
            globals: WriteBarrierGlobals::new(),
            published: Mutex::new(Published::default()),
            initialized: AtomicBool::new(false),
            memory_model,
        }
    }

    /// Globals read by the mutator barrier
    pub fn globals(&self) -> &WriteBarrierGlobals {
        &self.globals
    }

    /// Whether `Initialize` has run
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Read the globals in barrier order while holding the published tables.
    ///
    /// Safe from any thread.
    pub fn view(&self) -> BarrierView {
        let published = self.published.lock();
        let g = &self.globals;
        let (card_table_lowest, card_table_highest) = published
            .card_table
            .as_ref()
            .map_or((0, 0), |t| (t.lowest(), t.highest()));
        BarrierView {
            lowest: g.lowest_address.load(Ordering::Acquire),
            highest: g.highest_address.load(Ordering::Acquire),
            card_table_lowest,
            card_table_highest,
            ephemeral_low: g.ephemeral_low.load(Ordering::Relaxed),
            ephemeral_high: g.ephemeral_high.load(Ordering::Relaxed),
            write_watch: published.write_watch.is_some(),
        }
    }

    /// Store barrier for threads a restart does not wait for.
    pub fn record_store_pinned(&self, slot: usize, value: usize) {
        let published = self.published.lock();
        let g = &self.globals;
        let lowest = g.lowest_address.load(Ordering::Acquire);
        let highest = g.highest_address.load(Ordering::Acquire);
        if slot < lowest || slot >= highest {
            return;
        }
        let ephemeral_low = g.ephemeral_low.load(Ordering::Relaxed);
        let ephemeral_high = g.ephemeral_high.load(Ordering::Relaxed);
        if value >= ephemeral_low && value < ephemeral_high {
            if let Some(table) = &published.card_table {
                table.mark_card(slot);
            }
        }
        if let Some(watch) = &published.write_watch {
            watch.mark_card(slot);
        }
    }

    /// Card table currently published
    pub fn card_table(&self) -> Option<Arc<CardTable>> {
        self.published.lock().card_table.clone()
    }

    /// Write-watch table currently published
    pub fn write_watch_table(&self) -> Option<Arc<CardTable>> {
        self.published.lock().write_watch.clone()
    }

    /// Apply one update.
    pub fn stomp(
        &self,
        coordinator: &SuspensionCoordinator,
        params: WriteBarrierParameters,
    ) -> GcResult<()> {
        let stopped = self.validate_claim(coordinator, params.is_runtime_suspended)?;
        let mut published = self.published.lock();

        tracing::debug!(
            target: "ee_gc::barrier",
            op = params.op.name(),
            suspended = stopped,
            "stomping write barrier"
        );

        match params.op {
            WriteBarrierOp::Initialize {
                card_table,
                lowest,
                highest,
                ephemeral_low,
                ephemeral_high,
            } => {
                if self.initialized.swap(true, Ordering::AcqRel) {
                    return Err(GcError::invariant("write barrier initialized twice"));
                }
                self.publish_card_table(&card_table, lowest, highest, stopped);
                self.globals
                    .ephemeral_low
                    .store(ephemeral_low, Ordering::Relaxed);
                self.globals
                    .ephemeral_high
                    .store(ephemeral_high, Ordering::Relaxed);
                published.card_table = Some(card_table);
            }
            WriteBarrierOp::StompResize {
                card_table,
                lowest,
                highest,
            } => {
                self.require_initialized()?;
                self.publish_card_table(&card_table, lowest, highest, stopped);
                if let Some(old) = published.card_table.replace(card_table) {
                    // A running cooperative thread may still be reading it
                    coordinator.defer(move || drop(old));
                }
            }
            WriteBarrierOp::StompEphemeral { low, high } => {
                self.require_initialized()?;
                self.globals.ephemeral_low.store(low, Ordering::Relaxed);
                self.globals.ephemeral_high.store(high, Ordering::Relaxed);
            }
            WriteBarrierOp::SwitchToWriteWatch { table } => {
                self.require_stopped(stopped, "switch_to_write_watch")?;
                self.globals
                    .write_watch
                    .store(Arc::as_ptr(&table) as *mut CardTable, Ordering::Release);
                if let Some(old) = published.write_watch.replace(table) {
                    coordinator.defer(move || drop(old));
                }
            }
            WriteBarrierOp::SwitchToNonWriteWatch => {
                self.require_stopped(stopped, "switch_to_non_write_watch")?;
                self.globals
                    .write_watch
                    .store(ptr::null_mut(), Ordering::Release);
                if let Some(old) = published.write_watch.take() {
                    coordinator.defer(move || drop(old));
                }
            }
        }
        Ok(())
    }

    fn publish_card_table(&self, table: &Arc<CardTable>, lowest: usize, highest: usize, stopped: bool) {
        let fence_needed = !stopped || self.memory_model.is_weak();
        self.globals
            .card_table
            .store(Arc::as_ptr(table) as *mut CardTable, Ordering::Release);
        if fence_needed {
            flush_process_write_buffers();
        }
        self.globals.lowest_address.store(lowest, Ordering::Release);
        self.globals.highest_address.store(highest, Ordering::Release);
        if fence_needed {
            flush_process_write_buffers();
        }
    }

    fn validate_claim(&self, coordinator: &SuspensionCoordinator, claimed: bool) -> GcResult<bool> {
        if claimed {
            coordinator.require_stopped_by_current().map_err(|e| {
                tracing::error!(target: "ee_gc::barrier", "barrier update claims a stopped world");
                e
            })?;
        } else if coordinator.is_world_stopped() {
            return Err(GcError::invariant(
                "barrier update claims a running world while it is stopped",
            ));
        }
        Ok(claimed)
    }

    fn require_initialized(&self) -> GcResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(GcError::invariant("write barrier used before initialization"))
        }
    }

    fn require_stopped(&self, stopped: bool, op: &str) -> GcResult<()> {
        if stopped {
            Ok(())
        } else {
            Err(GcError::invariant(format!("{op} requires a stopped world")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::events::NoopEventSink;
    use crate::registry::ThreadRegistry;
    use crate::safepoint::PollingHijack;
    use crate::suspend::SuspendReason;

    fn coordinator() -> SuspensionCoordinator {
        SuspensionCoordinator::new(
            &GcConfig::default(),
            Arc::new(PollingHijack),
            Arc::new(NoopEventSink),
        )
    }

    fn init(updater: &WriteBarrierUpdater, coord: &SuspensionCoordinator, lo: usize, hi: usize) {
        updater
            .stomp(
                coord,
                WriteBarrierParameters::running(WriteBarrierOp::Initialize {
                    card_table: Arc::new(CardTable::new(lo, hi)),
                    lowest: lo,
                    highest: hi,
                    ephemeral_low: lo,
                    ephemeral_high: hi,
                }),
            )
            .unwrap();
    }

    #[test]
    fn test_card_table_marking() {
        let table = CardTable::new(0x1000, 0x1000 + 4 * CARD_SIZE);
        assert_eq!(table.len(), 4);
        assert!(table.mark_card(0x1000 + CARD_SIZE + 3));
        assert!(table.is_dirty(0x1000 + CARD_SIZE));
        assert!(!table.is_dirty(0x1000));
        assert!(!table.mark_card(0x1000 + 4 * CARD_SIZE));
        assert_eq!(table.dirty_count(), 1);
        table.clear();
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_initialize_once() {
        let coord = coordinator();
        let updater = WriteBarrierUpdater::new(MemoryModel::Strong);
        init(&updater, &coord, 0x10000, 0x20000);
        assert!(updater.is_initialized());
        let again = updater.stomp(
            &coord,
            WriteBarrierParameters::running(WriteBarrierOp::Initialize {
                card_table: Arc::new(CardTable::new(0, 0x100)),
                lowest: 0,
                highest: 0x100,
                ephemeral_low: 0,
                ephemeral_high: 0x100,
            }),
        );
        assert!(matches!(again, Err(GcError::InvariantViolation(_))));
        let view = updater.view();
        assert_eq!((view.lowest, view.highest), (0x10000, 0x20000));
    }

    #[test]
    fn test_resize_retires_old_table_until_restart() {
        let coord = coordinator();
        let registry = ThreadRegistry::new();
        let updater = WriteBarrierUpdater::new(MemoryModel::Weak);
        init(&updater, &coord, 0x10000, 0x20000);
        let old = updater.card_table().unwrap();

        updater
            .stomp(
                &coord,
                WriteBarrierParameters::running(WriteBarrierOp::StompResize {
                    card_table: Arc::new(CardTable::new(0x10000, 0x40000)),
                    lowest: 0x10000,
                    highest: 0x40000,
                }),
            )
            .unwrap();
        assert!(updater.view().is_consistent());
        assert_eq!(updater.view().highest, 0x40000);
        // Our handle plus the deferred one
        assert_eq!(Arc::strong_count(&old), 2);

        coord.suspend(&registry, SuspendReason::ForGC).unwrap();
        coord.restart(&registry, true).unwrap();
        assert_eq!(Arc::strong_count(&old), 1);
    }

    #[test]
    fn test_write_watch_requires_stopped_world() {
        let coord = coordinator();
        let registry = ThreadRegistry::new();
        let updater = WriteBarrierUpdater::new(MemoryModel::Strong);
        init(&updater, &coord, 0x10000, 0x20000);
        let table = Arc::new(CardTable::new(0x10000, 0x20000));

        let running = updater.stomp(
            &coord,
            WriteBarrierParameters::running(WriteBarrierOp::SwitchToWriteWatch {
                table: table.clone(),
            }),
        );
        assert!(matches!(running, Err(GcError::InvariantViolation(_))));

        // A false claim is rejected too
        let lying = updater.stomp(
            &coord,
            WriteBarrierParameters::suspended(WriteBarrierOp::SwitchToWriteWatch {
                table: table.clone(),
            }),
        );
        assert!(matches!(lying, Err(GcError::InvariantViolation(_))));

        coord.suspend(&registry, SuspendReason::ForGC).unwrap();
        updater
            .stomp(
                &coord,
                WriteBarrierParameters::suspended(WriteBarrierOp::SwitchToWriteWatch { table }),
            )
            .unwrap();
        assert!(updater.view().write_watch);
        updater
            .stomp(
                &coord,
                WriteBarrierParameters::suspended(WriteBarrierOp::SwitchToNonWriteWatch),
            )
            .unwrap();
        assert!(!updater.view().write_watch);
        coord.restart(&registry, false).unwrap();
    }

    #[test]
    fn test_locked_view_matches_lock_free_view() {
        let coord = coordinator();
        let updater = WriteBarrierUpdater::new(MemoryModel::Strong);
        assert!(updater.view().is_consistent());
        assert_eq!(updater.view().card_table_highest, 0);

        init(&updater, &coord, 0x10000, 0x20000);
        // SAFETY: no restart can run, nothing is retired
        let lock_free = unsafe { updater.globals().view() };
        assert_eq!(updater.view(), lock_free);
        assert_eq!(
            (lock_free.card_table_lowest, lock_free.card_table_highest),
            (0x10000, 0x20000)
        );
    }

    #[test]
    fn test_pinned_store_marks_tables_after_retirement() {
        let coord = coordinator();
        let registry = ThreadRegistry::new();
        let updater = WriteBarrierUpdater::new(MemoryModel::Strong);
        init(&updater, &coord, 0x10000, 0x20000);

        updater
            .stomp(
                &coord,
                WriteBarrierParameters::running(WriteBarrierOp::StompResize {
                    card_table: Arc::new(CardTable::new(0x10000, 0x40000)),
                    lowest: 0x10000,
                    highest: 0x40000,
                }),
            )
            .unwrap();
        coord.suspend(&registry, SuspendReason::ForGC).unwrap();
        let watch = Arc::new(CardTable::new(0x10000, 0x40000));
        updater
            .stomp(
                &coord,
                WriteBarrierParameters::suspended(WriteBarrierOp::SwitchToWriteWatch {
                    table: watch.clone(),
                }),
            )
            .unwrap();
        coord.restart(&registry, true).unwrap();
        assert_eq!(coord.deferred_len(), 0);

        // Value inside the ephemeral range, then a slot outside the heap
        updater.record_store_pinned(0x30000, 0x18000);
        updater.record_store_pinned(0x50000, 0x18000);
        let table = updater.card_table().unwrap();
        assert!(table.is_dirty(0x30000));
        assert_eq!(table.dirty_count(), 1);
        assert!(watch.is_dirty(0x30000));
        assert_eq!(watch.dirty_count(), 1);
        assert!(updater.view().write_watch);
    }

    #[test]
    fn test_record_store_filters() {
        let coord = coordinator();
        let updater = WriteBarrierUpdater::new(MemoryModel::Strong);
        init(&updater, &coord, 0x10000, 0x20000);
        updater
            .stomp(
                &coord,
                WriteBarrierParameters::running(WriteBarrierOp::StompEphemeral {
                    low: 0x18000,
                    high: 0x20000,
                }),
            )
            .unwrap();
        let table = updater.card_table().unwrap();
        let globals = updater.globals();

        unsafe {
            // Old-to-old store: no card
            globals.record_store(0x10000, 0x11000);
            // Slot outside the heap
            globals.record_store(0x30000, 0x18000);
        }
        assert_eq!(table.dirty_count(), 0);

        unsafe { globals.record_store(0x10008, 0x18010) };
        assert!(table.is_dirty(0x10008));
        assert_eq!(table.dirty_count(), 1);
    }
}
