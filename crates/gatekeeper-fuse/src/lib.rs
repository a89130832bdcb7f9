//! Lock-enforcing passthrough FUSE filesystem.
//!
//! Mirrors a source directory at a mount point. Files marked locked in the
//! remote catalog cannot be opened, read or written through the mount;
//! creations, deletions, renames and opens of tracked files are reported
//! back to the catalog.
//!
//! # Usage
//!
//! ```ignore
//! use gatekeeper_fuse::{GatekeeperFS, MountConfig, Passthrough, mount};
//!
//! let fs = Passthrough::new(source, cache, notifier, stats);
//! let handle = mount(GatekeeperFS::new(fs, MountConfig::default()), mountpoint, &config)?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod flags;
pub mod handles;
pub mod inode;
pub mod passthrough;

pub use backend::{FuseMountHandle, mount};
pub use config::MountConfig;
pub use error::{FsError, FsResult};
pub use filesystem::GatekeeperFS;
pub use flags::{O_BINARY, OpenAccess, sanitize_open_flags};
pub use handles::{OpenFile, OpenFileTable};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
pub use passthrough::{DirListing, EntryKind, Passthrough, VolumeStats};
