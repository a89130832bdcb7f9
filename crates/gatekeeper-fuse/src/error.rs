//! Error mapping for filesystem replies.

use gatekeeper_mount::io_error_to_errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single filesystem operation.
#[derive(Debug, Error)]
pub enum FsError {
    /// The file is locked in the catalog.
    #[error("access denied: {0} is locked")]
    AccessDenied(String),

    /// The real path does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Any other error from the backing directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unknown or already released file handle.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Unknown inode.
    #[error("invalid inode: {0}")]
    InvalidInode(u64),

    /// The name cannot be mapped onto the source directory.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl FsError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::AccessDenied(_) => libc::EACCES,
            FsError::NotFound(_) | FsError::InvalidInode(_) => libc::ENOENT,
            FsError::Io(e) => io_error_to_errno(e),
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::InvalidName(_) => libc::EINVAL,
        }
    }

    /// Maps a lookup failure, turning `ENOENT` into [`FsError::NotFound`].
    pub(crate) fn from_lookup(e: io::Error, path: impl Into<PathBuf>) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            FsError::NotFound(path.into())
        } else {
            FsError::Io(e)
        }
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;
