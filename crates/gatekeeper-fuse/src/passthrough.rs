//! Path-level passthrough with lock enforcement.
//!
//! [`Passthrough`] is the part of the filesystem that knows about locks.
//! It takes virtual paths (relative to the mount root, with or without a
//! leading `/`), maps them onto the source directory, and forwards each call
//! to the real filesystem. Open, read and write consult the [`LockCache`]
//! first and refuse locked files with `EACCES`.
//!
//! Mutations of tracked files (create, unlink, rename, successful open) are
//! reported to the catalog through the [`CatalogNotifier`]. Reporting never
//! blocks and never fails the filesystem call.
//!
//! Narrow cache updates are only applied to files directly under the root,
//! since only those have catalog rows. Lock checks use the basename at any
//! depth.

use crate::error::{FsError, FsResult};
use crate::flags::{OpenAccess, sanitize_open_flags};
use crate::handles::{OpenFile, OpenFileTable};
use filetime::FileTime;
use gatekeeper_core::names::{basename, tracked_name};
use gatekeeper_core::{CatalogEvent, CatalogNotifier, LockCache, PolicyStats};
use std::ffi::OsString;
use std::fs::{self, DirBuilder, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Kind of a directory entry, taken from `readdir` without a `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<fs::FileType> for EntryKind {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::File
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        }
    }
}

/// One entry returned by [`Passthrough::list_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: OsString,
    pub kind: EntryKind,
}

/// Filesystem statistics of the source volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Passthrough adapter over a source directory.
#[derive(Debug)]
pub struct Passthrough {
    root: PathBuf,
    cache: Arc<LockCache>,
    notifier: CatalogNotifier,
    handles: OpenFileTable,
    stats: Arc<PolicyStats>,
}

impl Passthrough {
    pub fn new(
        root: impl Into<PathBuf>,
        cache: Arc<LockCache>,
        notifier: CatalogNotifier,
        stats: Arc<PolicyStats>,
    ) -> Self {
        Self {
            root: root.into(),
            cache,
            notifier,
            handles: OpenFileTable::new(),
            stats,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &Arc<LockCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<PolicyStats> {
        &self.stats
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Maps a virtual path onto the source directory.
    ///
    /// A leading separator is stripped and the remainder joined onto the
    /// root. Paths that would climb out of the root are rejected.
    pub fn real_path(&self, path: &Path) -> FsResult<PathBuf> {
        let mut real = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => real.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(FsError::InvalidName(path.display().to_string()));
                }
            }
        }
        Ok(real)
    }

    /// `lstat` of the real path.
    pub fn getattr(&self, path: &Path) -> FsResult<Metadata> {
        let real = self.real_path(path)?;
        fs::symlink_metadata(&real).map_err(|e| FsError::from_lookup(e, path))
    }

    /// Lists a directory: `.` and `..` first, then the real entries.
    ///
    /// A path that is not a directory yields only the two pseudo-entries.
    pub fn list_directory(&self, path: &Path) -> FsResult<Vec<DirListing>> {
        let real = self.real_path(path)?;
        let mut entries = vec![
            DirListing {
                name: OsString::from("."),
                kind: EntryKind::Directory,
            },
            DirListing {
                name: OsString::from(".."),
                kind: EntryKind::Directory,
            },
        ];
        if !real.is_dir() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&real)? {
            let entry = entry?;
            let kind = match entry.file_type() {
                Ok(ft) => EntryKind::from(ft),
                // Removed while listing.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(DirListing {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    /// Reads the target of a symlink.
    pub fn read_link(&self, path: &Path) -> FsResult<PathBuf> {
        let real = self.real_path(path)?;
        fs::read_link(&real).map_err(|e| FsError::from_lookup(e, path))
    }

    /// Opens an existing file and returns its handle.
    ///
    /// Locked files are refused before the real file is touched.
    pub fn open(&self, path: &Path, flags: i32) -> FsResult<u64> {
        let name = basename(path).map(str::to_owned);
        self.check_unlocked(name.as_deref(), "open")?;

        let access = OpenAccess::from_flags(sanitize_open_flags(flags));
        let real = self.real_path(path)?;
        let file = access
            .options()
            .open(&real)
            .map_err(|e| FsError::from_lookup(e, path))?;

        let fh = self.handles.insert(OpenFile::new(file, name.clone(), path.to_path_buf()));
        debug!(fh, path = %path.display(), ?access, "Opened file");

        if let Some(tracked) = tracked_name(path) {
            self.notifier.notify(CatalogEvent::Accessed(tracked.to_string()));
        }
        Ok(fh)
    }

    /// Creates (or opens for writing) a file and returns its handle.
    ///
    /// A file that did not exist yet gets an unlocked cache entry, so the new
    /// name is usable before the next reconciliation. An existing file is
    /// opened without truncation and is refused if locked.
    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> FsResult<u64> {
        let real = self.real_path(path)?;
        let name = basename(path).map(str::to_owned);
        if fs::symlink_metadata(&real).is_ok() {
            self.check_unlocked(name.as_deref(), "create")?;
        }

        let access = OpenAccess::from_flags(sanitize_open_flags(flags));
        let mut opts = OpenOptions::new();
        opts.read(access == OpenAccess::ReadWrite)
            .write(true)
            .mode(mode)
            .create_new(true);
        let (file, existed) = match opts.open(&real) {
            Ok(file) => (file, false),
            Err(e)
                if e.kind() == std::io::ErrorKind::AlreadyExists && flags & libc::O_EXCL == 0 =>
            {
                (opts.create_new(false).open(&real)?, true)
            }
            Err(e) => return Err(e.into()),
        };

        if existed {
            // The file may have appeared between the existence check and the open.
            self.check_unlocked(name.as_deref(), "create")?;
        } else if is_root_level(path)
            && let Some(name) = &name
        {
            self.cache.set(name, false);
        }

        let fh = self.handles.insert(OpenFile::new(file, name, path.to_path_buf()));
        debug!(fh, path = %path.display(), mode = format_args!("{mode:o}"), existed, "Created file");

        if let Some(tracked) = tracked_name(path) {
            self.notifier.notify(CatalogEvent::Created(tracked.to_string()));
        }
        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`. Short only at end of file.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))?;
        self.check_unlocked(handle.name.as_deref(), "read")?;

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match handle.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        trace!(fh, offset, requested = size, read = filled, "read");
        Ok(buf)
    }

    /// Writes all of `data` at `offset` and returns the byte count.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let handle = self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))?;
        self.check_unlocked(handle.name.as_deref(), "write")?;

        handle.file.write_all_at(data, offset)?;
        trace!(fh, offset, len = data.len(), "write");
        Ok(data.len())
    }

    /// Closes a handle.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        let handle = self.handles.remove(fh).ok_or(FsError::InvalidHandle(fh))?;
        trace!(fh, path = %handle.path.display(), "release");
        Ok(())
    }

    /// Flushes a handle durably to disk.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        let handle = self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))?;
        handle.file.sync_all()?;
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let handle = self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))?;
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a file, then forgets its lock state.
    pub fn unlink(&self, path: &Path) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::remove_file(&real).map_err(|e| FsError::from_lookup(e, path))?;

        if is_root_level(path) && let Some(name) = basename(path) {
            self.cache.remove(name);
        }
        if let Some(tracked) = tracked_name(path) {
            self.notifier.notify(CatalogEvent::Deleted(tracked.to_string()));
        }
        debug!(path = %path.display(), "Unlinked file");
        Ok(())
    }

    /// Renames a file or directory and carries its lock state along.
    ///
    /// The target's lock is not consulted, so a locked file can be replaced.
    pub fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let real_from = self.real_path(from)?;
        let real_to = self.real_path(to)?;
        fs::rename(&real_from, &real_to).map_err(|e| FsError::from_lookup(e, from))?;

        match (is_root_level(from), is_root_level(to)) {
            (true, true) => {
                if let (Some(old), Some(new)) = (basename(from), basename(to)) {
                    self.cache.rename(old, new);
                }
            }
            (true, false) => {
                if let Some(old) = basename(from) {
                    self.cache.remove(old);
                }
            }
            _ => {}
        }

        if let Some(event) = CatalogEvent::for_rename(tracked_name(from), tracked_name(to)) {
            self.notifier.notify(event);
        }
        debug!(from = %from.display(), to = %to.display(), "Renamed");
        Ok(())
    }

    /// Sets access and/or modification time. `None` keeps the current value.
    pub fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> FsResult<()> {
        let real = self.real_path(path)?;
        let current = fs::symlink_metadata(&real).map_err(|e| FsError::from_lookup(e, path))?;
        let atime = atime.map_or_else(|| FileTime::from_last_access_time(&current), FileTime::from_system_time);
        let mtime = mtime.map_or_else(
            || FileTime::from_last_modification_time(&current),
            FileTime::from_system_time,
        );
        filetime::set_symlink_file_times(&real, atime, mtime)?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::set_permissions(&real, Permissions::from_mode(mode)).map_err(|e| FsError::from_lookup(e, path))
    }

    /// Ownership changes are accepted and ignored.
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        trace!(path = %path.display(), ?uid, ?gid, "chown ignored");
        Ok(())
    }

    /// Truncates or extends a file, through an open handle if one is given.
    pub fn truncate(&self, path: &Path, size: u64, fh: Option<u64>) -> FsResult<()> {
        if let Some(handle) = fh.and_then(|fh| self.handles.get(fh)) {
            handle.file.set_len(size)?;
            return Ok(());
        }
        let real = self.real_path(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&real)
            .map_err(|e| FsError::from_lookup(e, path))?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        let real = self.real_path(path)?;
        DirBuilder::new().mode(mode).create(&real)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::remove_dir(&real).map_err(|e| FsError::from_lookup(e, path))
    }

    /// Statistics of the volume holding the source directory.
    pub fn statfs(&self) -> FsResult<VolumeStats> {
        let stat = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|errno| FsError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        // These fit in u32 on every supported platform.
        #[allow(clippy::cast_possible_truncation)]
        let (block_size, name_max, fragment_size) =
            (stat.block_size() as u32, stat.name_max() as u32, stat.fragment_size() as u32);
        #[allow(clippy::useless_conversion)]
        Ok(VolumeStats {
            blocks: u64::from(stat.blocks()),
            blocks_free: u64::from(stat.blocks_free()),
            blocks_available: u64::from(stat.blocks_available()),
            files: u64::from(stat.files()),
            files_free: u64::from(stat.files_free()),
            block_size,
            name_max,
            fragment_size,
        })
    }

    /// Closes every open handle, e.g. on unmount.
    pub fn release_all(&self) -> usize {
        self.handles.drain().len()
    }

    fn check_unlocked(&self, name: Option<&str>, operation: &'static str) -> FsResult<()> {
        match name {
            Some(name) if self.cache.is_locked(name) => {
                self.stats.record_denied();
                warn!(filename = %name, operation, "Access denied: file is locked");
                Err(FsError::AccessDenied(name.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// True for paths naming an entry directly under the root.
fn is_root_level(path: &Path) -> bool {
    let mut normal = path.components().filter(|c| matches!(c, Component::Normal(_)));
    normal.next().is_some() && normal.next().is_none()
}
