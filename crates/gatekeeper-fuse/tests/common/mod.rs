//! Test mount harness for FUSE integration tests.
//!
//! `TestMount` mounts a fresh source directory with an in-memory lock cache
//! and unmounts on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use gatekeeper_core::{CatalogEvent, CatalogNotifier, LockCache, PolicyStats};
use gatekeeper_fuse::{FuseMountHandle, GatekeeperFS, MountConfig, Passthrough, mount};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Returns true if a FUSE device is present.
pub fn fuse_available() -> bool {
    gatekeeper_mount::fuse_available()
}

/// Skip test if FUSE is not installed.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}

/// A mounted source directory for testing.
pub struct TestMount {
    handle: Option<FuseMountHandle>,
    /// Lock state consulted by the mount.
    pub cache: Arc<LockCache>,
    pub stats: Arc<PolicyStats>,
    /// Catalog events emitted by the mount.
    pub events: mpsc::Receiver<CatalogEvent>,
    pub mount_path: PathBuf,
    pub source_path: PathBuf,
    _source: TempDir,
    _mount_dir: TempDir,
}

impl TestMount {
    pub fn new() -> Result<Self, String> {
        let source = TempDir::new().map_err(|e| format!("Failed to create source dir: {e}"))?;
        let mount_dir = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = mount_dir.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let cache = Arc::new(LockCache::new());
        let stats = Arc::new(PolicyStats::new());
        let (notifier, events) = CatalogNotifier::channel(1024, Arc::clone(&stats));
        let adapter = Passthrough::new(source.path(), Arc::clone(&cache), notifier, Arc::clone(&stats));

        let config = MountConfig::default()
            .fsname("gatekeeper-test")
            .mount_timeout(Duration::from_secs(5));
        let handle = mount(GatekeeperFS::new(adapter, config.clone()), &mount_path, &config)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        Ok(Self {
            handle: Some(handle),
            cache,
            stats,
            events,
            mount_path,
            source_path: source.path().to_path_buf(),
            _source: source,
            _mount_dir: mount_dir,
        })
    }

    /// Path of `name` inside the mount.
    pub fn path(&self, name: &str) -> PathBuf {
        self.mount_path.join(name)
    }

    /// Path of `name` in the backing directory.
    pub fn source(&self, name: &str) -> PathBuf {
        self.source_path.join(name)
    }

    pub fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        fs::write(self.path(name), data)
    }

    pub fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }

    pub fn lock(&self, name: &str) {
        self.cache.set(name, true);
    }

    pub fn unlock(&self, name: &str) {
        self.cache.set(name, false);
    }

    pub fn drain_events(&mut self) -> Vec<CatalogEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mount_path
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unmount();
        }
    }
}

/// Asserts that `result` failed with `EACCES`.
pub fn assert_denied<T: std::fmt::Debug>(result: io::Result<T>) {
    let err = result.expect_err("expected access to be denied");
    assert_eq!(err.raw_os_error(), Some(libc::EACCES), "unexpected error: {err}");
}
