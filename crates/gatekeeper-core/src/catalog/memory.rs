//! In-process catalog.
//!
//! Used for `--offline` mounts, where locks are only ever set through
//! [`MemoryCatalog::set_locked`], and by tests, which also inspect the
//! operation log and simulate outages.

use super::{Catalog, FileRecord};
use crate::error::{CatalogError, CatalogResult};
use crate::names::normalize;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// A mutating call received by a [`MemoryCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOp {
    Insert(String),
    Delete(String),
    Rename(String, String),
    Touch(String),
}

/// Catalog that keeps rows in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    rows: Mutex<BTreeMap<String, FileRecord>>,
    ops: Mutex<Vec<CatalogOp>>,
    unavailable: AtomicBool,
    rejected: Mutex<HashSet<String>>,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog preloaded with `(filename, is_locked)` rows.
    pub fn with_rows<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let catalog = Self::new();
        {
            let mut map = catalog.rows.lock();
            for (name, locked) in rows {
                let name = name.into();
                map.insert(
                    normalize(&name),
                    FileRecord {
                        filename: name,
                        is_locked: locked,
                        last_accessed: None,
                    },
                );
            }
        }
        catalog
    }

    /// Sets the lock flag of a row, creating the row if needed.
    pub fn set_locked(&self, filename: &str, locked: bool) {
        let mut rows = self.rows.lock();
        rows.entry(normalize(filename))
            .or_insert_with(|| FileRecord::unlocked(filename))
            .is_locked = locked;
    }

    /// Makes every subsequent call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes mutating calls that name `filename` fail, leaving every other
    /// row and `fetch_all` working.
    pub fn reject_writes_for(&self, filename: &str) {
        self.rejected.lock().insert(normalize(filename));
    }

    /// Returns a copy of the row for `filename`.
    pub fn get(&self, filename: &str) -> Option<FileRecord> {
        self.rows.lock().get(&normalize(filename)).cloned()
    }

    /// Returns the stored filenames in sorted (normalized) order.
    pub fn filenames(&self) -> Vec<String> {
        self.rows.lock().values().map(|r| r.filename.clone()).collect()
    }

    /// Returns the mutating calls received so far.
    pub fn ops(&self) -> Vec<CatalogOp> {
        self.ops.lock().clone()
    }

    /// Clears the operation log.
    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn check_available(&self) -> CatalogResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("memory catalog marked unavailable".into()));
        }
        Ok(())
    }

    fn check_writable(&self, operation: &'static str, filename: &str) -> CatalogResult<()> {
        self.check_available()?;
        if self.rejected.lock().contains(&normalize(filename)) {
            return Err(CatalogError::Status {
                operation,
                status: 409,
                body: format!("write to {filename} rejected"),
            });
        }
        Ok(())
    }

    fn log(&self, op: CatalogOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn fetch_all(&self) -> CatalogResult<Vec<FileRecord>> {
        self.check_available()?;
        Ok(self.rows.lock().values().cloned().collect())
    }

    async fn insert(&self, filename: &str) -> CatalogResult<()> {
        self.check_writable("insert", filename)?;
        self.log(CatalogOp::Insert(filename.to_string()));
        self.rows
            .lock()
            .entry(normalize(filename))
            .or_insert_with(|| FileRecord {
                filename: filename.to_string(),
                is_locked: false,
                last_accessed: Some(Utc::now()),
            });
        Ok(())
    }

    async fn delete(&self, filename: &str) -> CatalogResult<()> {
        self.check_writable("delete", filename)?;
        self.log(CatalogOp::Delete(filename.to_string()));
        self.rows.lock().remove(&normalize(filename));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> CatalogResult<()> {
        self.check_writable("rename", from)?;
        self.check_writable("rename", to)?;
        self.log(CatalogOp::Rename(from.to_string(), to.to_string()));
        let mut rows = self.rows.lock();
        if let Some(mut record) = rows.remove(&normalize(from)) {
            record.filename = to.to_string();
            rows.insert(normalize(to), record);
        }
        Ok(())
    }

    async fn touch(&self, filename: &str) -> CatalogResult<()> {
        self.check_writable("touch", filename)?;
        self.log(CatalogOp::Touch(filename.to_string()));
        if let Some(record) = self.rows.lock().get_mut(&normalize(filename)) {
            record.last_accessed = Some(Utc::now());
        }
        Ok(())
    }
}
