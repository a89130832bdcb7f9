//! Lock policy engine for the Gatekeeper passthrough filesystem.
//!
//! The authoritative lock state of every file lives in a remote catalog.
//! This crate keeps a local, eventually-consistent copy of that state and
//! the machinery that keeps it fresh:
//!
//! - [`LockCache`] - in-memory filename → locked map, read on every
//!   open/read/write and replaced wholesale by the reconciler
//! - [`Catalog`] - async interface to the remote catalog, with the REST
//!   implementation in [`catalog::rest`] and an in-memory one in
//!   [`catalog::memory`]
//! - [`CatalogNotifier`] - bounded queue that carries fire-and-forget
//!   catalog updates from filesystem handlers to a single worker task
//! - [`Reconciler`] - periodic task that diffs the local directory against
//!   the catalog, uploads new files, removes ghost rows and republishes the
//!   lock map
//!
//! # Consistency
//!
//! Lock checks never wait on the network. A file unknown to the cache is
//! treated as unlocked (fail-open), so a file created locally and locked
//! remotely before the next reconciliation cycle stays accessible for up to
//! one poll interval. That window is inherent to polling and is accepted.
//!
//! Rename, unlink and truncate are not lock-checked. Renaming another file over a
//! locked one replaces its contents locally; the catalog rename then fails
//! on the existing row and the next cycle settles the catalog from the local
//! directory. This is accepted alongside the creation window.
//!
//! # Example
//!
//! ```
//! use gatekeeper_core::LockCache;
//! use std::collections::HashMap;
//!
//! let cache = LockCache::new();
//! assert!(!cache.is_locked("report.docx"));
//!
//! cache.replace_all(HashMap::from([("report.docx".to_string(), true)]));
//! assert!(cache.is_locked("REPORT.docx"));
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod lock_cache;
pub mod names;
pub mod notifier;
pub mod reconciler;
pub mod stats;

pub use catalog::{Catalog, CatalogOp, FileRecord, MemoryCatalog, RestCatalog};
pub use config::{CatalogConfig, ConfigError, GatekeeperConfig, SyncConfig, parse_duration};
pub use error::{CatalogError, CatalogResult};
pub use lock_cache::LockCache;
pub use names::{is_tracked_name, normalize};
pub use notifier::{CatalogEvent, CatalogNotifier, NotifierTask};
pub use reconciler::{ReconcileError, ReconcileReport, Reconciler, ReconcilerHandle};
pub use stats::{PolicyStats, PolicyStatsSnapshot};
