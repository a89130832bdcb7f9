//! Periodic reconciliation between the local directory and the catalog.
//!
//! Each cycle:
//!
//! 1. lists the regular, tracked files directly under the source root
//! 2. fetches every catalog row
//! 3. replaces the [`LockCache`] with the fetched lock map
//! 4. inserts an unlocked row for every local file the catalog lacks
//! 5. deletes every row whose file no longer exists locally
//!
//! A failure in step 1 or 2 ends the cycle; per-row failures in steps 4 and
//! 5 are logged and counted without stopping the other rows. Cycles run on
//! a fixed interval with no backoff.

use crate::catalog::{Catalog, FileRecord};
use crate::config::SyncConfig;
use crate::error::CatalogError;
use crate::lock_cache::LockCache;
use crate::names::{is_tracked_name, normalize};
use crate::stats::PolicyStats;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// A cycle that ended before touching the catalog rows.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to list source directory {path}: {source}")]
    ListLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch catalog: {0}")]
    Fetch(#[source] CatalogError),
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tracked files found locally.
    pub local_files: usize,
    /// Rows returned by the catalog.
    pub remote_rows: usize,
    /// Rows marked locked.
    pub locked: usize,
    /// Local-only files inserted into the catalog.
    pub uploaded: Vec<String>,
    /// Ghost rows deleted from the catalog.
    pub removed: Vec<String>,
    /// Inserts or deletes that failed.
    pub failed: usize,
    /// Wall time of the cycle in milliseconds.
    pub elapsed_ms: u64,
}

/// Keeps the lock cache and the catalog in step with the source directory.
pub struct Reconciler {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
    cache: Arc<LockCache>,
    stats: Arc<PolicyStats>,
    interval: Duration,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        root: impl Into<PathBuf>,
        catalog: Arc<dyn Catalog>,
        cache: Arc<LockCache>,
        stats: Arc<PolicyStats>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            root: root.into(),
            catalog,
            cache,
            stats,
            interval: config.interval,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Source directory being reconciled.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists tracked regular files under the root, keyed by normalized name.
    ///
    /// Subdirectories and symlinks are skipped, as are names that are not
    /// valid UTF-8.
    pub async fn list_local(&self) -> std::io::Result<HashMap<String, String>> {
        let mut files = HashMap::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_tracked_name(&name) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {
                    files.insert(normalize(&name), name);
                }
                Ok(_) => {}
                // Removed between readdir and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }

    /// Runs one cycle, recording the outcome in the stats.
    #[instrument(level = "debug", skip(self), fields(root = %self.root.display()))]
    pub async fn run_cycle(&self) -> Result<ReconcileReport, ReconcileError> {
        let result = self.cycle().await;
        match &result {
            Ok(report) => {
                if report.uploaded.is_empty() && report.removed.is_empty() && report.failed == 0 {
                    debug!(
                        local = report.local_files,
                        remote = report.remote_rows,
                        locked = report.locked,
                        "Reconciliation cycle complete"
                    );
                } else {
                    info!(
                        uploaded = report.uploaded.len(),
                        removed = report.removed.len(),
                        failed = report.failed,
                        "Reconciliation cycle applied changes"
                    );
                }
            }
            Err(e) => {
                self.stats.record_cycle_failed();
                warn!(error = %e, "Reconciliation cycle aborted");
            }
        }
        result
    }

    async fn cycle(&self) -> Result<ReconcileReport, ReconcileError> {
        let started = Instant::now();

        let local = self
            .list_local()
            .await
            .map_err(|source| ReconcileError::ListLocal {
                path: self.root.clone(),
                source,
            })?;

        let records = self
            .catalog
            .fetch_all()
            .await
            .map_err(ReconcileError::Fetch)?;
        let remote: HashMap<String, FileRecord> = records
            .into_iter()
            .map(|r| (normalize(&r.filename), r))
            .collect();

        self.cache.replace_all(
            remote
                .iter()
                .map(|(key, record)| (key.clone(), record.is_locked))
                .collect(),
        );
        self.stats.record_cycle_completed();

        let mut uploads: Vec<String> = local
            .iter()
            .filter(|(key, _)| !remote.contains_key(*key))
            .map(|(_, name)| name.clone())
            .collect();
        uploads.sort();
        let mut ghosts: Vec<String> = remote
            .iter()
            .filter(|(key, _)| !local.contains_key(*key))
            .map(|(_, record)| record.filename.clone())
            .collect();
        ghosts.sort();

        let mut report = ReconcileReport {
            local_files: local.len(),
            remote_rows: remote.len(),
            locked: remote.values().filter(|r| r.is_locked).count(),
            ..Default::default()
        };

        let catalog = self.catalog.as_ref();
        let uploaded: Vec<(String, bool)> = stream::iter(uploads)
            .map(|name| async move {
                let ok = match catalog.insert(&name).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(file = %name, error = %e, "Failed to register local file");
                        false
                    }
                };
                (name, ok)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (name, ok) in uploaded {
            if ok {
                self.stats.record_remote_ok();
                self.stats.record_uploaded();
                report.uploaded.push(name);
            } else {
                self.stats.record_remote_failed();
                report.failed += 1;
            }
        }

        let removed: Vec<(String, bool)> = stream::iter(ghosts)
            .map(|name| async move {
                let ok = match catalog.delete(&name).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(file = %name, error = %e, "Failed to remove ghost row");
                        false
                    }
                };
                (name, ok)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (name, ok) in removed {
            if ok {
                self.stats.record_remote_ok();
                self.stats.record_ghost_removed();
                report.removed.push(name);
            } else {
                self.stats.record_remote_failed();
                report.failed += 1;
            }
        }

        report.uploaded.sort();
        report.removed.sort();
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }

    /// Starts the periodic loop on `runtime`.
    ///
    /// The first cycle runs immediately; later cycles start `interval` after
    /// the previous one finished.
    pub fn spawn(self, runtime: &Handle) -> ReconcilerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = runtime.spawn(async move {
            info!(interval = ?self.interval, "Reconciler started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                // Errors are already logged and counted.
                let _ = self.run_cycle().await;
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Reconciler stopped");
        });
        ReconcilerHandle { join, stop: stop_tx }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("root", &self.root)
            .field("interval", &self.interval)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Handle to a running reconciler loop.
#[derive(Debug)]
pub struct ReconcilerHandle {
    join: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ReconcilerHandle {
    /// Signals the loop to stop and waits for the in-flight cycle to end.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Reconciler task failed");
        }
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
