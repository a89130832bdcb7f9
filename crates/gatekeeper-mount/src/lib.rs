//! Mount plumbing for Gatekeeper frontends.
//!
//! Nothing here knows about locks or catalogs. This crate holds the pieces
//! every mount needs regardless of policy:
//!
//! - [`HandleTable`] - open file handles keyed by FUSE `fh`
//! - [`io_error_to_errno`] - errno for replies built from `std::io::Error`
//! - [`mount_utils`] - source directory and mount point checks
//! - [`signal`] - SIGINT/SIGTERM/SIGHUP driven shutdown

pub mod errno;
pub mod error;
pub mod handle_table;
pub mod mount_utils;
pub mod signal;

pub use errno::io_error_to_errno;
pub use error::MountError;
pub use handle_table::HandleTable;
pub use mount_utils::{DEFAULT_ACCESS_TIMEOUT, check_mountpoint, ensure_source_dir, fuse_available};
pub use signal::{
    install_signal_handler, request_shutdown, shutdown_requested, wait_for_shutdown,
    wait_for_shutdown_timeout,
};
