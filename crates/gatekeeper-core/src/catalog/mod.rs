//! Remote file catalog.
//!
//! The catalog is the authority for lock state. It holds one row per tracked
//! file: `{filename, is_locked, last_accessed}`. [`RestCatalog`] talks to a
//! PostgREST-style service; [`MemoryCatalog`] keeps rows in process for
//! offline mounts and tests.

pub mod memory;
pub mod rest;

pub use memory::{CatalogOp, MemoryCatalog};
pub use rest::RestCatalog;

use crate::error::CatalogResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub is_locked: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// An unlocked record with no access time.
    pub fn unlocked(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            is_locked: false,
            last_accessed: None,
        }
    }
}

/// Row as it appears on the wire.
///
/// `is_locked` may be null for rows inserted by other tools, and
/// `last_accessed` is parsed leniently so a malformed timestamp on one row
/// does not discard the whole listing.
#[derive(Debug, Deserialize)]
pub(crate) struct CatalogRow {
    filename: String,
    #[serde(default)]
    is_locked: Option<bool>,
    #[serde(default)]
    last_accessed: Option<String>,
}

impl From<CatalogRow> for FileRecord {
    fn from(row: CatalogRow) -> Self {
        let last_accessed = row
            .last_accessed
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            filename: row.filename,
            is_locked: row.is_locked.unwrap_or(false),
            last_accessed,
        }
    }
}

/// Operations on the remote catalog.
///
/// Every call is independent and may fail; callers decide whether a failure
/// matters. None of these are invoked from a filesystem handler directly.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Lists every row (up to the configured row limit).
    async fn fetch_all(&self) -> CatalogResult<Vec<FileRecord>>;

    /// Inserts an unlocked row. Inserting an existing name is not an error.
    async fn insert(&self, filename: &str) -> CatalogResult<()>;

    /// Deletes the row for `filename`. Deleting a missing row is not an error.
    async fn delete(&self, filename: &str) -> CatalogResult<()>;

    /// Renames the row for `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> CatalogResult<()>;

    /// Stamps `last_accessed` with the current time.
    async fn touch(&self, filename: &str) -> CatalogResult<()>;
}
