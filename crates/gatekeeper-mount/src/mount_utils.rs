//! Checks run before mounting.

use crate::error::MountError;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

/// How long a mount point probe may block before the path is considered a
/// stale FUSE mount.
pub const DEFAULT_ACCESS_TIMEOUT: Duration = Duration::from_millis(500);

/// Returns true if a FUSE implementation is installed.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
            || Path::new("/Library/Filesystems/osxfuse.fs").exists()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Creates the source directory if needed and returns its canonical path.
pub fn ensure_source_dir(path: &Path) -> Result<PathBuf, MountError> {
    let source_err = |source| MountError::Source {
        path: path.to_path_buf(),
        source,
    };
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(source_err)?;
        tracing::info!(path = %path.display(), "Created source directory");
    }
    let canonical = path.canonicalize().map_err(source_err)?;
    if !canonical.is_dir() {
        return Err(source_err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            "not a directory",
        )));
    }
    Ok(canonical)
}

/// Validates a mount point against its source directory.
///
/// The mount point must be an existing, responsive directory that neither
/// contains nor is contained by the source tree, otherwise the filesystem
/// would end up serving itself.
pub fn check_mountpoint(mountpoint: &Path, source: &Path, timeout: Duration) -> Result<PathBuf, MountError> {
    let probe = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();
    // Probing a stale FUSE mount blocks, so it happens off-thread.
    std::thread::spawn(move || {
        let result = std::fs::metadata(&probe).map(|m| m.is_dir()).and_then(|is_dir| {
            if is_dir {
                std::fs::read_dir(&probe).map(|_| true)
            } else {
                Ok(false)
            }
        });
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => return Err(MountError::MountpointNotDirectory(mountpoint.to_path_buf())),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MountError::MountpointMissing(mountpoint.to_path_buf()));
        }
        Ok(Err(_)) | Err(_) => return Err(MountError::MountpointStale(mountpoint.to_path_buf())),
    }

    let canonical = mountpoint
        .canonicalize()
        .map_err(|_| MountError::MountpointStale(mountpoint.to_path_buf()))?;
    if canonical.starts_with(source) || source.starts_with(&canonical) {
        return Err(MountError::MountpointOverlapsSource {
            mountpoint: canonical,
            source_dir: source.to_path_buf(),
        });
    }
    Ok(canonical)
}
