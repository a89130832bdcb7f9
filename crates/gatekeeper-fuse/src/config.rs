//! Mount configuration for the FUSE filesystem.

use std::time::Duration;

/// Filesystem name shown in mount tables.
pub const DEFAULT_FSNAME: &str = "Gatekeeper_Secure";

/// Attribute and entry TTL handed to the kernel.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// How long `mount` waits for the kernel to acknowledge the mount.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options for the FUSE filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for cached attributes and entries.
    ///
    /// Kept short: a lock applied remotely must not be masked by a stale
    /// kernel cache for longer than one reconciliation interval.
    pub attr_ttl: Duration,

    /// Open files with `FOPEN_DIRECT_IO`, so every read and write reaches
    /// the filesystem and is checked against the current lock state.
    pub direct_io: bool,

    /// Name reported as the mount source.
    pub fsname: String,

    /// Let users other than the mounting user access the mount. Requires
    /// `user_allow_other` in `/etc/fuse.conf`.
    pub allow_other: bool,

    /// Timeout for the mount to become visible.
    pub mount_timeout: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            direct_io: true,
            fsname: DEFAULT_FSNAME.to_string(),
            allow_other: false,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    #[must_use]
    pub fn fsname(mut self, name: impl Into<String>) -> Self {
        self.fsname = name.into();
        self
    }

    #[must_use]
    pub fn allow_other(mut self, enabled: bool) -> Self {
        self.allow_other = enabled;
        self
    }

    #[must_use]
    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }
}
