//! Open file handles.

use gatekeeper_mount::HandleTable;
use std::fs::File;
use std::path::PathBuf;

/// A file opened through the mount.
///
/// Owns the native descriptor; it is closed when the last reference to the
/// entry drops after `release`.
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    /// Basename used for lock re-checks on read and write. `None` if the
    /// name is not valid UTF-8, in which case it can never be locked.
    pub name: Option<String>,
    /// Virtual path at open time.
    pub path: PathBuf,
}

impl OpenFile {
    pub fn new(file: File, name: Option<String>, path: PathBuf) -> Self {
        Self { file, name, path }
    }
}

/// Handle table specialised for open files.
pub type OpenFileTable = HandleTable<OpenFile>;
