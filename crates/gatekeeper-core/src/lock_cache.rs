//! In-memory view of remote lock state.
//!
//! Every open/read/write consults this cache synchronously, so lookups must
//! never touch the network. The reconciler replaces the whole map once per
//! cycle; create/unlink/rename handlers apply single-key updates so a
//! just-created file is usable before the next cycle.
//!
//! A single map-wide [`RwLock`] guards the map. Whole-map replacement happens
//! under the write lock, so a reader sees either the old map or the new one,
//! never a mix.

use crate::names::normalize;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cached lock state keyed by normalized filename.
#[derive(Debug, Default)]
pub struct LockCache {
    entries: RwLock<HashMap<String, bool>>,
    /// Number of whole-map replacements, for diagnostics.
    generation: AtomicU64,
}

impl LockCache {
    /// Creates an empty cache. Every file starts out unlocked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `filename` is locked.
    ///
    /// The lookup is case-insensitive. Unknown files are unlocked.
    pub fn is_locked(&self, filename: &str) -> bool {
        let key = normalize(filename);
        self.entries.read().get(&key).copied().unwrap_or(false)
    }

    /// Returns the cached state for `filename`, or `None` if unknown.
    pub fn get(&self, filename: &str) -> Option<bool> {
        self.entries.read().get(&normalize(filename)).copied()
    }

    /// Atomically replaces the whole map.
    ///
    /// Keys are normalized before the swap; the lock is held only for the
    /// pointer swap, the old map is dropped afterwards.
    pub fn replace_all(&self, map: HashMap<String, bool>) {
        let normalized: HashMap<String, bool> = map
            .into_iter()
            .map(|(name, locked)| (normalize(&name), locked))
            .collect();

        let old = {
            let mut guard = self.entries.write();
            std::mem::replace(&mut *guard, normalized)
        };
        self.generation.fetch_add(1, Ordering::Relaxed);
        drop(old);
    }

    /// Sets the state of a single file.
    pub fn set(&self, filename: &str, locked: bool) {
        self.entries.write().insert(normalize(filename), locked);
    }

    /// Forgets a single file, returning its previous state.
    pub fn remove(&self, filename: &str) -> Option<bool> {
        self.entries.write().remove(&normalize(filename))
    }

    /// Moves the entry for `from` to `to`.
    ///
    /// The destination inherits the source's state; if the source was unknown
    /// any stale destination entry is dropped so both names fall back to the
    /// unlocked default.
    pub fn rename(&self, from: &str, to: &str) {
        let from = normalize(from);
        let to = normalize(to);
        let mut guard = self.entries.write();
        match guard.remove(&from) {
            Some(locked) => {
                guard.insert(to, locked);
            }
            None => {
                guard.remove(&to);
            }
        }
    }

    /// Returns a copy of the current map.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.entries.read().clone()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the number of entries currently marked locked.
    pub fn locked_count(&self) -> usize {
        self.entries.read().values().filter(|locked| **locked).count()
    }

    /// Returns how many times [`replace_all`](Self::replace_all) has run.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}
