//! The live-handle table.
//!
//! An ordered registry of every handle in the process, guarded by its own
//! exclusive/shared lock. Insertion and removal take the exclusive side;
//! removal happens exactly once, in the reaper, after the entry's own lock
//! confirms it is unreferenced.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::Handle;

/// Registry of all live handles.
pub struct HandleTable {
    entries: RwLock<Vec<Arc<Handle>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl HandleTable {
    pub fn new() -> Arc<HandleTable> {
        Arc::new(HandleTable {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        })
    }

    /// Create a handle and register it.
    pub fn create(&self) -> Arc<Handle> {
        let handle = Handle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.adopt(handle.clone());
        handle
    }

    /// Register an externally created handle.
    pub fn adopt(&self, handle: Arc<Handle>) {
        self.entries.write().push(handle);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// True while the handle is reachable from the table.
    pub fn contains(&self, handle: &Arc<Handle>) -> bool {
        self.entries.read().iter().any(|h| Arc::ptr_eq(h, handle))
    }

    pub(crate) fn entries(&self) -> &RwLock<Vec<Arc<Handle>>> {
        &self.entries
    }

    pub(crate) fn note_removed(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_registers_and_counts() {
        let table = HandleTable::new();
        let a = table.create();
        let b = table.create();
        assert_ne!(a.id(), b.id());
        assert_eq!(table.live_count(), 2);
        assert!(table.contains(&a));
        assert!(table.contains(&b));
    }
}
