//! I/O error to errno mapping.

use std::io;

/// Converts an I/O error to the errno a filesystem reply should carry.
///
/// OS errors keep their raw code, so an `EACCES` or `ENOSPC` from the
/// backing directory reaches the caller unchanged. Errors without an OS
/// code are classified by kind, falling back to `EIO`.
#[inline]
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidFilename => libc::EINVAL,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        io::ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        io::ErrorKind::IsADirectory => libc::EISDIR,
        io::ErrorKind::NotADirectory => libc::ENOTDIR,
        _ => libc::EIO,
    }
}
