//! Filename normalization and the tracked-file filter.
//!
//! The catalog keys rows by filename, case-insensitively. Editors and
//! operating systems litter a shared folder with lock files, swap files and
//! folder metadata; none of those belong in the catalog, so they are filtered
//! out both when listing the local directory and before emitting catalog
//! notifications.

use std::path::Path;

/// Prefix Microsoft Office uses for its owner lock files (`~$report.docx`).
pub const LOCK_FILE_PREFIX: &str = "~$";

/// Platform metadata files, compared after normalization.
const METADATA_NAMES: &[&str] = &["desktop.ini", "thumbs.db", ".ds_store", "icon\r"];

/// Extensions of transient files written by editors and browsers.
const TEMP_EXTENSIONS: &[&str] = &[
    "tmp",
    "temp",
    "swp",
    "swo",
    "swx",
    "part",
    "partial",
    "crdownload",
];

/// Returns the catalog key for a filename.
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
}

/// Returns true if `name` is a file the catalog should know about.
pub fn is_tracked_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || name.starts_with(LOCK_FILE_PREFIX) {
        return false;
    }
    if name.ends_with('~') {
        return false;
    }

    let lower = normalize(name);
    if METADATA_NAMES.contains(&lower.as_str()) {
        return false;
    }

    match lower.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => !TEMP_EXTENSIONS.contains(&ext),
        _ => true,
    }
}

/// Returns the final component of a virtual path as UTF-8.
///
/// Non-UTF-8 names have no catalog representation and yield `None`.
pub fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Returns the tracked filename for a virtual path.
///
/// Only regular files directly under the mount root appear in the catalog,
/// so paths inside subdirectories yield `None`, as do names rejected by
/// [`is_tracked_name`].
pub fn tracked_name(path: &Path) -> Option<&str> {
    let relative = path.strip_prefix("/").unwrap_or(path);
    let mut components = relative.components();
    let first = components.next()?;
    if components.next().is_some() {
        return None;
    }
    first.as_os_str().to_str().filter(|name| is_tracked_name(name))
}
