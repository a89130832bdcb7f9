//! Errors raised while preparing or running a mount.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("FUSE is not available on this system")]
    FuseUnavailable,

    #[error("source directory {path} is unusable: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount point {0} does not exist")]
    MountpointMissing(PathBuf),

    #[error("mount point {0} is not a directory")]
    MountpointNotDirectory(PathBuf),

    #[error("mount point {0} is not responding (stale mount?)")]
    MountpointStale(PathBuf),

    #[error("mount point {mountpoint} overlaps source directory {source_dir}")]
    MountpointOverlapsSource {
        mountpoint: PathBuf,
        source_dir: PathBuf,
    },

    #[error("mount failed: {0}")]
    Mount(#[source] std::io::Error),

    #[error("mount did not become ready within {0:?}")]
    Timeout(std::time::Duration),
}
