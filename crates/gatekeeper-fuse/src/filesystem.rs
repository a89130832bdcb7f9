//! FUSE filesystem implementation.
//!
//! [`GatekeeperFS`] translates inode-based `fuser` callbacks into the
//! path-based calls of [`Passthrough`], which does the real work and the lock
//! checks. This layer owns the inode table and builds kernel attributes.
//!
//! | Operation | Notes |
//! |-----------|-------|
//! | lookup/forget | `lookup` counts a reference, `forget` evicts at zero |
//! | getattr/setattr | `lstat` of the real path; chown is accepted and ignored |
//! | open/create | refused with `EACCES` for locked files |
//! | read/write | lock re-checked on every call |
//! | readdir | `.` and `..` first; index-based offsets |
//! | unlink/rename | not lock-checked; update cache and catalog |
//! | mkdir/rmdir/readlink/statfs | plain passthrough |

use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use crate::inode::{InodeTable, ROOT_INODE};
use crate::passthrough::{EntryKind, Passthrough};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// `RENAME_NOREPLACE` from `linux/fs.h`.
#[cfg(target_os = "linux")]
const RENAME_NOREPLACE: u32 = 1;

/// Lock-enforcing passthrough filesystem.
pub struct GatekeeperFS {
    fs: Passthrough,
    inodes: InodeTable,
    config: MountConfig,
}

impl GatekeeperFS {
    pub fn new(fs: Passthrough, config: MountConfig) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            config,
        }
    }

    pub fn passthrough(&self) -> &Passthrough {
        &self.fs
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    fn inode_path(&self, ino: u64) -> FsResult<PathBuf> {
        self.inodes.get_path(ino).ok_or(FsError::InvalidInode(ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.as_bytes().contains(&b'/') {
            return Err(FsError::InvalidName(name.to_string_lossy().into_owned()));
        }
        Ok(self.inode_path(parent)?.join(name))
    }

    fn open_flags(&self) -> u32 {
        if self.config.direct_io {
            fuser::consts::FOPEN_DIRECT_IO
        } else {
            0
        }
    }

    /// Only `RENAME_NOREPLACE` is supported, and only on Linux.
    fn check_rename_flags(&self, flags: u32, to: &Path) -> FsResult<()> {
        if flags == 0 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if flags == RENAME_NOREPLACE {
            return match self.fs.getattr(to) {
                Ok(_) => Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EEXIST))),
                Err(_) => Ok(()),
            };
        }
        let _ = to;
        Err(FsError::InvalidName(format!("unsupported rename flags {flags:#x}")))
    }

    /// Stats `path` and binds it to an inode, counting one lookup.
    fn entry_for(&self, path: &Path) -> FsResult<FileAttr> {
        let meta = self.fs.getattr(path)?;
        let ino = self.inodes.get_or_insert(path);
        Ok(attr_from_metadata(ino, &meta))
    }
}

impl std::fmt::Debug for GatekeeperFS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperFS")
            .field("root", &self.fs.root())
            .field("inodes", &self.inodes.len())
            .field("open_handles", &self.fs.open_handles())
            .finish_non_exhaustive()
    }
}

/// Builds kernel attributes from the real file's metadata.
pub fn attr_from_metadata(ino: u64, meta: &Metadata) -> FileAttr {
    let mtime = system_time(meta.mtime(), meta.mtime_nsec());
    // Permission bits fit in 12 bits; rdev is truncated as the kernel ABI does.
    #[allow(clippy::cast_possible_truncation)]
    let (perm, rdev) = ((meta.mode() & 0o7777) as u16, meta.rdev() as u32);
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime,
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(mtime),
        kind: file_type(meta.file_type()),
        perm,
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev,
        blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
        flags: 0,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = u32::try_from(nsecs).unwrap_or(0);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs.unsigned_abs(), nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nanos.into())
    }
}

fn file_type(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::RegularFile
    }
}

fn entry_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::File | EntryKind::Other => FileType::RegularFile,
    }
}

fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

impl Filesystem for GatekeeperFS {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        info!(root = %self.fs.root().display(), "FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let released = self.fs.release_all();
        info!(released, "FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        let result = self.child_path(parent, name).and_then(|path| self.entry_for(&path));
        match result {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.inode_path(ino).and_then(|path| self.fs.getattr(&path)) {
            Ok(meta) => reply.attr(&self.config.attr_ttl, &attr_from_metadata(ino, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, "setattr");
        let result = self.inode_path(ino).and_then(|path| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size, fh)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs.utimens(&path, resolve_time(atime), resolve_time(mtime))?;
            }
            self.fs.getattr(&path)
        });
        match result {
            Ok(meta) => reply.attr(&self.config.attr_ttl, &attr_from_metadata(ino, &meta)),
            Err(e) => {
                debug!(inode = ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self.inode_path(ino).and_then(|path| self.fs.read_link(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        let path = match self.inode_path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let entries = match self.fs.list_directory(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.get_inode(parent))
            .unwrap_or(ROOT_INODE);

        let skip = usize::try_from(offset).unwrap_or(0);
        for (index, entry) in entries.iter().enumerate().skip(skip) {
            let entry_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => parent_ino,
                _ => self.inodes.get_or_insert_no_lookup_inc(&path.join(&entry.name)),
            };
            let next = i64::try_from(index + 1).unwrap_or(i64::MAX);
            if reply.add(entry_ino, next, entry_file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        match self.inode_path(ino).and_then(|path| self.fs.open(&path, flags)) {
            Ok(fh) => reply.opened(fh, self.open_flags()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, name = ?name, mode, flags, "create");
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let fh = match self.fs.create(&path, mode & !umask, flags) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match self.entry_for(&path) {
            Ok(attr) => reply.created(&self.config.attr_ttl, &attr, 0, fh, self.open_flags()),
            Err(e) => {
                let _ = self.fs.release(fh);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode, "mkdir");
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.mkdir(&path, mode & !umask)?;
            self.entry_for(&path)
        });
        match result {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.unlink(&path)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.rmdir(&path)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, name = ?name, newparent, newname = ?newname, flags, "rename");
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.check_rename_flags(flags, &to)?;
            self.fs.rename(&from, &to)?;
            self.inodes.rename_path(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        match self.fs.statfs() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_available,
                s.files,
                s.files_free,
                s.block_size,
                s.name_max,
                s.fragment_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
