//! Inode management for the FUSE filesystem.
//!
//! Maps FUSE inode numbers to virtual paths under the mount root and back.
//! Paths are absolute-style (`/`, `/docs/a.txt`). Each entry carries the
//! kernel's lookup count so `forget` can evict it.

use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Virtual path of the entry.
    pub path: PathBuf,
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: PathBuf, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count`.
    ///
    /// Returns `None` if that would go negative; the count is left as is.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional inode/path table.
#[derive(Debug)]
pub struct InodeTable {
    by_inode: DashMap<u64, InodeEntry>,
    by_path: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the root.
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let by_inode = DashMap::new();
        by_inode.insert(ROOT_INODE, InodeEntry::new(root.clone(), 1));
        let by_path = DashMap::new();
        by_path.insert(root, ROOT_INODE);
        Self {
            by_inode,
            by_path,
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup against it.
    pub fn get_or_insert(&self, path: &Path) -> u64 {
        let inode = self.get_or_insert_no_lookup_inc(path);
        if let Some(entry) = self.by_inode.get(&inode) {
            entry.inc_nlookup();
        }
        inode
    }

    /// Like [`get_or_insert`](Self::get_or_insert) without touching the
    /// lookup count. Used for `readdir`, which does not take a reference.
    pub fn get_or_insert_no_lookup_inc(&self, path: &Path) -> u64 {
        if let Some(inode) = self.by_path.get(path) {
            return *inode;
        }
        *self.by_path.entry(path.to_path_buf()).or_insert_with(|| {
            let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
            self.by_inode
                .insert(inode, InodeEntry::new(path.to_path_buf(), 0));
            inode
        })
    }

    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.by_inode.get(&inode)
    }

    /// Virtual path currently bound to `inode`.
    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.by_inode.get(&inode).map(|e| e.path.clone())
    }

    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).map(|i| *i)
    }

    /// Drops `nlookup` kernel references. Returns true if the inode was
    /// evicted. The root is never evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.by_inode.get(&inode) else {
            return false;
        };
        if entry.dec_nlookup(nlookup) != Some(0) {
            return false;
        }
        drop(entry);

        match self.by_inode.remove(&inode) {
            Some((_, entry)) => {
                self.by_path.remove_if(&entry.path, |_, mapped| *mapped == inode);
                true
            }
            None => false,
        }
    }

    /// Unbinds `path` after a delete. The inode entry stays until the
    /// kernel forgets it.
    pub fn invalidate_path(&self, path: &Path) {
        self.by_path.remove(path);
    }

    /// Rebinds `old` (and everything below it) to `new` after a rename.
    ///
    /// Any inode previously bound to `new` loses its path binding.
    pub fn rename_path(&self, old: &Path, new: &Path) {
        self.invalidate_path(new);

        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|e| e.key().starts_with(old))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (path, inode) in moved {
            let Ok(suffix) = path.strip_prefix(old) else {
                continue;
            };
            let target = if suffix.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(suffix)
            };
            self.by_path.remove(&path);
            if let Some(mut entry) = self.by_inode.get_mut(&inode) {
                entry.path.clone_from(&target);
            }
            self.by_path.insert(target, inode);
        }
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    /// True if only the root is present.
    pub fn is_empty(&self) -> bool {
        self.by_inode.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
