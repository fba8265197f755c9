//! Registry of attached threads

use crate::error::{GcError, GcResult};
use crate::thread::ThreadRecord;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set of live thread records.
///
/// The lock guards membership only. It is never held across a suspension
/// cycle, so "is the world stopped" queries never wait on attach/detach.
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<ThreadRecord>>>,
    next_id: AtomicU64,
    /// Allocation counters folded in from detached threads
    dead_thread_bytes: AtomicU64,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dead_thread_bytes: AtomicU64::new(0),
        }
    }

    /// Register the calling OS thread
    pub(crate) fn attach(
        &self,
        name: Option<String>,
        gc_special: bool,
    ) -> GcResult<Arc<ThreadRecord>> {
        let os_thread = std::thread::current().id();
        let mut threads = self.threads.write();
        if threads.iter().any(|t| t.os_thread() == os_thread) {
            return Err(GcError::invariant(format!(
                "OS thread {os_thread:?} is already attached"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ThreadRecord::new(id, os_thread, name, gc_special));
        threads.push(record.clone());
        tracing::debug!(target: "ee_gc::threads", id, gc_special, live = threads.len(), "thread attached");
        Ok(record)
    }

    /// Remove a record, folding its allocation counters into the dead-thread total
    pub(crate) fn detach(&self, record: &Arc<ThreadRecord>, allocated_bytes: u64) -> bool {
        let mut threads = self.threads.write();
        let before = threads.len();
        threads.retain(|t| t.id() != record.id());
        let removed = threads.len() != before;
        if removed {
            self.dead_thread_bytes
                .fetch_add(allocated_bytes, Ordering::Relaxed);
            tracing::debug!(
                target: "ee_gc::threads",
                id = record.id(),
                allocated_bytes,
                live = threads.len(),
                "thread detached"
            );
        }
        removed
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().clone()
    }

    /// Visit every record under the read lock
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ThreadRecord>)) {
        for record in self.threads.read().iter() {
            f(record);
        }
    }

    /// Record of the calling OS thread, if attached
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        let os_thread = std::thread::current().id();
        self.threads
            .read()
            .iter()
            .find(|t| t.os_thread() == os_thread)
            .cloned()
    }

    /// Look a record up by id
    pub fn get(&self, id: u64) -> Option<Arc<ThreadRecord>> {
        self.threads.read().iter().find(|t| t.id() == id).cloned()
    }

    /// Number of attached threads
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Whether no thread is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes allocated by threads that have since detached
    pub fn dead_thread_bytes(&self) -> u64 {
        self.dead_thread_bytes.load(Ordering::Relaxed)
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let registry = ThreadRegistry::new();
        let record = registry.attach(Some("main".into()), false).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.current().unwrap().id(), record.id());

        assert!(registry.detach(&record, 128));
        assert!(registry.is_empty());
        assert_eq!(registry.dead_thread_bytes(), 128);
        assert!(!registry.detach(&record, 128));
        assert_eq!(registry.dead_thread_bytes(), 128);
    }

    #[test]
    fn test_double_attach_rejected() {
        let registry = ThreadRegistry::new();
        let _record = registry.attach(None, false).unwrap();
        assert!(matches!(
            registry.attach(None, false),
            Err(GcError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let registry = Arc::new(ThreadRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.attach(None, false).unwrap().id())
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&0));
        assert_eq!(registry.len(), 4);
    }
}
