//! Open file handle table.
//!
//! FUSE identifies open files by a `u64` handle chosen by the filesystem.
//! Entries are stored behind `Arc` so a read or write can clone the entry
//! out of the shard and do its I/O without holding the map lock; the entry
//! itself is released when the last clone drops after `release` removes it.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map from handle id to an open entry.
///
/// ```
/// use gatekeeper_mount::HandleTable;
///
/// let table: HandleTable<String> = HandleTable::new();
/// let fh = table.insert("a.txt".to_string());
/// assert_eq!(fh, 1);
/// assert_eq!(table.get(fh).as_deref().map(String::as_str), Some("a.txt"));
/// assert!(table.remove(fh).is_some());
/// assert!(table.remove(fh).is_none());
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    entries: DashMap<u64, Arc<V>>,
    /// Next id to hand out. 0 is never used.
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    /// Creates an empty table. The first handle is 1.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores `value` under a fresh handle and returns the handle.
    pub fn insert(&self, value: V) -> u64 {
        let value = Arc::new(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Skip 0 after wrap-around, and any id still in use.
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(value);
                return id;
            }
        }
    }

    /// Returns the entry for `fh`.
    pub fn get(&self, fh: u64) -> Option<Arc<V>> {
        self.entries.get(&fh).map(|e| Arc::clone(e.value()))
    }

    /// Removes the entry for `fh`. A second removal of the same handle
    /// returns `None`.
    pub fn remove(&self, fh: u64) -> Option<Arc<V>> {
        self.entries.remove(&fh).map(|(_, v)| v)
    }

    pub fn contains(&self, fh: u64) -> bool {
        self.entries.contains_key(&fh)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry, e.g. on unmount.
    pub fn drain(&self) -> Vec<(u64, Arc<V>)> {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = HandleTable::new();
        assert_eq!(table.insert("a"), 1);
        assert_eq!(table.insert("b"), 2);
        assert_eq!(table.insert("c"), 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let table = HandleTable::new();
        let fh = table.insert(7);
        assert_eq!(table.remove(fh).as_deref(), Some(&7));
        assert!(table.remove(fh).is_none());
        assert!(table.get(fh).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_outlives_remove() {
        let table = HandleTable::new();
        let fh = table.insert(String::from("open"));
        let held = table.get(fh).unwrap();
        table.remove(fh);
        assert_eq!(held.as_str(), "open");
    }

    #[test]
    fn test_wraparound_skips_zero() {
        let table = HandleTable::new();
        table.next_id.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(table.insert(()), u64::MAX);
        assert_eq!(table.insert(()), 1);
    }

    #[test]
    fn test_wraparound_skips_live_ids() {
        let table = HandleTable::new();
        let first = table.insert("live");
        table.next_id.store(first, Ordering::Relaxed);
        let second = table.insert("new");
        assert_ne!(first, second);
        assert_eq!(table.get(first).as_deref(), Some(&"live"));
    }

    #[test]
    fn test_drain() {
        let table = HandleTable::new();
        table.insert(1);
        table.insert(2);
        let mut drained: Vec<i32> = table.drain().into_iter().map(|(_, v)| *v).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_are_unique() {
        let table = Arc::new(HandleTable::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || (0..250).map(|i| table.insert(t * 1000 + i)).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert!(seen.insert(id), "duplicate handle {id}");
            }
        }
        assert_eq!(table.len(), 2000);
    }
}
