//! Mounting and unmounting.
//!
//! [`mount`] runs the filesystem in a background FUSE session and returns a
//! [`FuseMountHandle`]. Dropping the handle unmounts.

use crate::config::MountConfig;
use crate::filesystem::GatekeeperFS;
use fuser::{BackgroundSession, MountOption};
use gatekeeper_mount::MountError;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Polling interval while waiting for the mount to appear.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout for graceful session join before forcing unmount.
/// The join thread may leak on timeout.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a mounted filesystem.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl FuseMountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Returns true while the mount point is served by a different device
    /// than its parent, i.e. the mount has not been removed externally.
    pub fn is_mounted(&self) -> bool {
        self.session.is_some() && is_mount_active(&self.mountpoint)
    }

    /// Unmounts and waits for the session to end.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting");
        self.join_or_force();
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounted");
    }

    fn join_or_force(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });

        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            tracing::warn!(
                mountpoint = %self.mountpoint.display(),
                timeout = ?JOIN_TIMEOUT,
                "Session did not end in time, forcing unmount"
            );
            force_unmount(&self.mountpoint);
        }
    }
}

impl std::fmt::Debug for FuseMountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("active", &self.session.is_some())
            .finish()
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        self.join_or_force();
    }
}

/// Unmounts using system tools, for when the session is wedged.
fn force_unmount(mountpoint: &Path) {
    #[cfg(target_os = "macos")]
    {
        let forced = std::process::Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mountpoint)
            .output()
            .is_ok_and(|out| out.status.success());
        if !forced {
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(mountpoint)
                .output();
        }
    }

    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("fusermount")
            .arg("-uz")
            .arg(mountpoint)
            .output();
    }
}

/// A mount is detected when the path's device id differs from its parent's.
fn is_mount_active(mountpoint: &Path) -> bool {
    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    match (std::fs::metadata(mountpoint), std::fs::metadata(parent)) {
        (Ok(path_meta), Ok(parent_meta)) => path_meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fsname.clone()),
        MountOption::Subtype("gatekeeper".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    #[cfg(target_os = "macos")]
    options.push(MountOption::CUSTOM(format!("volname={}", config.fsname)));
    options
}

/// Mounts `fs` at `mountpoint` and waits until the kernel serves it.
pub fn mount(
    fs: GatekeeperFS,
    mountpoint: &Path,
    config: &MountConfig,
) -> Result<FuseMountHandle, MountError> {
    tracing::info!(
        source = %fs.passthrough().root().display(),
        mountpoint = %mountpoint.display(),
        "Starting FUSE mount"
    );

    let options = mount_options(config);
    let session = spawn_mount_with_timeout(fs, mountpoint, options, config.mount_timeout)?;
    let handle = FuseMountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
    };
    wait_for_mount(mountpoint, config.mount_timeout)?;

    tracing::info!(mountpoint = %mountpoint.display(), "FUSE mount successful");
    Ok(handle)
}

/// `spawn_mount2` can block on a stale mount point, so it runs on its own
/// thread.
fn spawn_mount_with_timeout(
    fs: GatekeeperFS,
    mountpoint: &Path,
    options: Vec<MountOption>,
    timeout: Duration,
) -> Result<BackgroundSession, MountError> {
    let mountpoint = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(MountError::Mount(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(MountError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(MountError::Mount(std::io::Error::other(
            "mount thread terminated unexpectedly",
        ))),
    }
}

fn wait_for_mount(mountpoint: &Path, timeout: Duration) -> Result<(), MountError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if is_mount_active(mountpoint) {
            tracing::debug!(mountpoint = %mountpoint.display(), "FUSE mount confirmed active");
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(MountError::Timeout(timeout))
}
