//! Per-thread bump-pointer allocation context

/// A thread's bump-pointer region `[alloc_ptr, alloc_limit)` plus accounting.
///
/// `combined_limit` is the point at which the next allocation sample fires;
/// it always lies between `alloc_ptr` and `alloc_limit`, and equals
/// `alloc_limit` when sampling is off.
///
/// The region is kept as raw addresses because the collector hands new
/// memory back as addresses; everything above this type uses [`bump`](Self::bump)
/// and [`remaining`](Self::remaining).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocContext {
    alloc_ptr: usize,
    alloc_limit: usize,
    combined_limit: usize,
    /// Bytes allocated in small-object regions handed to this context
    pub alloc_bytes: u64,
    /// Bytes allocated directly on user-old-heaps by this thread
    pub alloc_bytes_uoh: u64,
}

impl AllocContext {
    /// Empty context; the first allocation takes the slow path
    pub const fn new() -> Self {
        Self {
            alloc_ptr: 0,
            alloc_limit: 0,
            combined_limit: 0,
            alloc_bytes: 0,
            alloc_bytes_uoh: 0,
        }
    }

    /// Current bump pointer
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// End of the region
    pub fn alloc_limit(&self) -> usize {
        self.alloc_limit
    }

    /// Sampling point (== limit when sampling is off)
    pub fn combined_limit(&self) -> usize {
        self.combined_limit
    }

    /// Bytes still available in the region
    pub fn remaining(&self) -> usize {
        self.alloc_limit - self.alloc_ptr
    }

    /// Bytes available before the sampling point
    pub fn remaining_before_sample(&self) -> usize {
        self.combined_limit - self.alloc_ptr
    }

    /// Whether the context currently owns a region
    pub fn is_empty(&self) -> bool {
        self.alloc_ptr == self.alloc_limit
    }

    /// Carve `size` bytes off the front of the region if they fit below `limit`.
    fn bump_below(&mut self, size: usize, limit: usize) -> Option<usize> {
        debug_assert!(self.alloc_ptr <= limit && limit <= self.alloc_limit);
        if size > limit - self.alloc_ptr {
            return None;
        }
        let addr = self.alloc_ptr;
        self.alloc_ptr += size;
        Some(addr)
    }

    /// Fast-path bump bounded by the sampling point.
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        self.bump_below(size, self.combined_limit)
    }

    /// Bump bounded by the region end, ignoring the sampling point.
    pub fn bump_to_limit(&mut self, size: usize) -> Option<usize> {
        self.bump_below(size, self.alloc_limit)
    }

    /// Install a fresh region `[start, limit)`.
    ///
    /// Called by the collector from its slow path. The region must be zeroed
    /// heap memory not yet handed to any object. The sampling point is reset
    /// to the region end; the engine recomputes it afterwards.
    pub fn set_region(&mut self, start: usize, limit: usize) {
        assert!(start <= limit, "allocation region start past its limit");
        self.alloc_ptr = start;
        self.alloc_limit = limit;
        self.combined_limit = limit;
        self.alloc_bytes += (limit - start) as u64;
    }

    /// Drop the current region; returns the unused tail `[alloc_ptr, alloc_limit)`.
    ///
    /// The unused bytes are subtracted from the accounting so `alloc_bytes`
    /// reflects what objects actually consumed.
    pub fn retire(&mut self) -> (usize, usize) {
        let tail = (self.alloc_ptr, self.alloc_limit);
        self.alloc_bytes -= (self.alloc_limit - self.alloc_ptr) as u64;
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
        self.combined_limit = 0;
        tail
    }

    /// Place the sampling point `budget` bytes ahead of the bump pointer.
    ///
    /// None turns sampling off for this context.
    pub fn set_sampling_budget(&mut self, budget: Option<u64>) {
        self.combined_limit = match budget {
            Some(bytes) => {
                let room = self.remaining() as u64;
                self.alloc_ptr + bytes.min(room) as usize
            }
            None => self.alloc_limit,
        };
    }

    /// Total bytes this context accounts for
    pub fn total_allocated(&self) -> u64 {
        self.alloc_bytes + self.alloc_bytes_uoh
    }
}
