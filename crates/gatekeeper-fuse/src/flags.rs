//! Open flag sanitization.
//!
//! Clients hand the filesystem whatever open flags their platform
//! produces, including bits the backing directory may not accept (Windows
//! clients over SMB/FUSE bridges are the usual offender). Only the access
//! mode is honored; every other bit is discarded and binary mode forced.

use std::fs::OpenOptions;

/// Binary mode flag. Text/binary translation does not exist on Unix, so
/// this is zero and forcing it is a no-op.
pub const O_BINARY: i32 = 0;

/// Keeps the access mode bits of `flags`, drops the rest, adds [`O_BINARY`].
#[inline]
pub fn sanitize_open_flags(flags: i32) -> i32 {
    (flags & libc::O_ACCMODE) | O_BINARY
}

/// Access mode of an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAccess {
    Read,
    Write,
    ReadWrite,
}

impl OpenAccess {
    /// Decodes the access mode bits of `flags`.
    ///
    /// The invalid mode `O_WRONLY | O_RDWR` is treated as read-write.
    pub fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccess::Read,
            libc::O_WRONLY => OpenAccess::Write,
            _ => OpenAccess::ReadWrite,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, OpenAccess::Read | OpenAccess::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, OpenAccess::Write | OpenAccess::ReadWrite)
    }

    /// `OpenOptions` for an existing file with this access mode.
    pub fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.is_read()).write(self.is_write());
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_access_mode_kept() {
        assert_eq!(sanitize_open_flags(libc::O_RDONLY), libc::O_RDONLY);
        assert_eq!(sanitize_open_flags(libc::O_WRONLY), libc::O_WRONLY);
        assert_eq!(sanitize_open_flags(libc::O_RDWR), libc::O_RDWR);
    }

    #[test]
    fn test_other_bits_dropped() {
        let flags = libc::O_RDWR | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_NONBLOCK;
        assert_eq!(sanitize_open_flags(flags), libc::O_RDWR);
    }

    #[test]
    fn test_open_access_decoding() {
        assert_eq!(OpenAccess::from_flags(libc::O_RDONLY | libc::O_CLOEXEC), OpenAccess::Read);
        assert_eq!(OpenAccess::from_flags(libc::O_WRONLY | libc::O_TRUNC), OpenAccess::Write);
        assert_eq!(OpenAccess::from_flags(libc::O_RDWR), OpenAccess::ReadWrite);
        assert!(OpenAccess::Read.is_read() && !OpenAccess::Read.is_write());
        assert!(OpenAccess::Write.is_write() && !OpenAccess::Write.is_read());
    }

    proptest! {
        #[test]
        fn prop_sanitized_flags_only_carry_access_mode(flags in any::<i32>()) {
            let clean = sanitize_open_flags(flags);
            prop_assert_eq!(clean & !libc::O_ACCMODE, 0);
            prop_assert_eq!(clean & libc::O_ACCMODE, flags & libc::O_ACCMODE);
        }
    }
}
