//! Fire-and-forget catalog notifications.
//!
//! Filesystem handlers must never wait on the network, so create, unlink,
//! rename and successful opens are turned into [`CatalogEvent`]s and pushed
//! onto a bounded queue with `try_send`. A single worker task drains the
//! queue in FIFO order and applies each event through the [`Catalog`]
//! trait. Failures are logged and counted; the reconciler's next sweep
//! repairs whatever a lost event left behind.

use crate::catalog::Catalog;
use crate::error::CatalogResult;
use crate::stats::PolicyStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A catalog update produced by a filesystem handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A tracked file was created locally.
    Created(String),
    /// A tracked file was deleted locally.
    Deleted(String),
    /// A tracked file was renamed and both names are tracked.
    Renamed { from: String, to: String },
    /// A tracked file was opened successfully.
    Accessed(String),
}

impl CatalogEvent {
    /// Maps a local rename onto a catalog event.
    ///
    /// Arguments are the tracked names of each side, or `None` when that
    /// side is filtered out (temp file, hidden file, subdirectory). Saving
    /// through a temp file and renaming it over the target therefore shows
    /// up as a creation, and renaming a file into a hidden name as a
    /// deletion.
    pub fn for_rename(from: Option<&str>, to: Option<&str>) -> Option<Self> {
        match (from, to) {
            (Some(from), Some(to)) => Some(Self::Renamed {
                from: from.to_string(),
                to: to.to_string(),
            }),
            (None, Some(to)) => Some(Self::Created(to.to_string())),
            (Some(from), None) => Some(Self::Deleted(from.to_string())),
            (None, None) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "insert",
            Self::Deleted(_) => "delete",
            Self::Renamed { .. } => "rename",
            Self::Accessed(_) => "touch",
        }
    }

    async fn apply(&self, catalog: &dyn Catalog) -> CatalogResult<()> {
        match self {
            Self::Created(name) => catalog.insert(name).await,
            Self::Deleted(name) => catalog.delete(name).await,
            Self::Renamed { from, to } => catalog.rename(from, to).await,
            Self::Accessed(name) => catalog.touch(name).await,
        }
    }
}

/// Sending side of the notification queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CatalogNotifier {
    tx: mpsc::Sender<CatalogEvent>,
    stats: Arc<PolicyStats>,
}

impl CatalogNotifier {
    /// Creates a notifier and the receiving end of its queue.
    ///
    /// Most callers want [`spawn`](Self::spawn); this is for tests that
    /// inspect the queue directly.
    pub fn channel(
        capacity: usize,
        stats: Arc<PolicyStats>,
    ) -> (Self, mpsc::Receiver<CatalogEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    /// Creates a notifier and spawns its worker on `runtime`.
    pub fn spawn(
        catalog: Arc<dyn Catalog>,
        capacity: usize,
        stats: Arc<PolicyStats>,
        runtime: &Handle,
    ) -> (Self, NotifierTask) {
        let (notifier, rx) = Self::channel(capacity, Arc::clone(&stats));
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = runtime.spawn(run_worker(rx, catalog, stats, stop_rx));
        (notifier, NotifierTask { join, stop: stop_tx })
    }

    /// Queues an event without blocking.
    ///
    /// Returns false if the event was dropped because the queue is full or
    /// the worker has gone away.
    pub fn notify(&self, event: CatalogEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.record_queued();
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.record_dropped();
                warn!(kind = event.kind(), ?event, "Catalog queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                trace!(?event, "Catalog queue closed, ignoring event");
                false
            }
        }
    }
}

/// Handle to the running notifier worker.
#[derive(Debug)]
pub struct NotifierTask {
    join: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl NotifierTask {
    /// Stops accepting events, delivers what is already queued, and waits
    /// up to `timeout` for the worker to finish. The worker is aborted if it
    /// does not finish in time.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.stop.send(true);
        let mut join = self.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => debug!("Catalog notifier drained"),
            Ok(Err(e)) => warn!(error = %e, "Catalog notifier task failed"),
            Err(_) => {
                warn!(?timeout, "Catalog notifier did not drain in time, aborting");
                join.abort();
            }
        }
    }

    /// Returns true once the worker has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Delivers queued events until every sender is dropped or a stop is
/// requested. On stop, the queue is closed and its remaining contents are
/// still delivered.
pub async fn run_worker(
    mut rx: mpsc::Receiver<CatalogEvent>,
    catalog: Arc<dyn Catalog>,
    stats: Arc<PolicyStats>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = rx.recv() => event,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    rx.close();
                }
                continue;
            }
        };
        let Some(event) = event else { break };
        deliver(&event, catalog.as_ref(), &stats).await;
    }
    debug!("Catalog notifier stopped");
}

async fn deliver(event: &CatalogEvent, catalog: &dyn Catalog, stats: &PolicyStats) {
    match event.apply(catalog).await {
        Ok(()) => {
            stats.record_remote_ok();
            trace!(kind = event.kind(), ?event, "Catalog updated");
        }
        Err(e) => {
            stats.record_remote_failed();
            warn!(kind = event.kind(), ?event, error = %e, "Catalog update failed");
        }
    }
}
