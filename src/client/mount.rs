// CLASSIFICATION: COMMUNITY
// Filename: mount.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-07-31

//! FUSE adapter. The kernel speaks inodes, the operations contract
//! speaks paths, so this keeps the ino<->path bookkeeping and forwards
//! every call to the single VFS collaborator handed over at mount time.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::trace;

use crate::client::vfs::Vfs;
use crate::proto::{Attributes, FileHandle, FsError, OpenFlags, RenameFlags, TimeSpec};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// The mount-side adapter owning the ino<->path tables.
pub struct Mount<V: Vfs> {
    vfs: Arc<V>,
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next_ino: u64,
    uid: u32,
    gid: u32,
}

impl<V: Vfs> Mount<V> {
    /// Adapter over the single VFS collaborator.
    #[must_use]
    pub fn new(vfs: Arc<V>) -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(ROOT_INO, PathBuf::from("/"));
        inodes.insert(PathBuf::from("/"), ROOT_INO);
        Self {
            vfs,
            paths,
            inodes,
            next_ino: ROOT_INO + 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, FsError> {
        let parent = self.paths.get(&parent).ok_or(FsError::NotFound)?;
        if name.to_str().is_none() {
            return Err(FsError::Invalid);
        }
        Ok(parent.join(name))
    }

    fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.inodes.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop the mapping for `path` and everything below it; stale
    /// entries would silently redirect kernel operations.
    fn forget_path(&mut self, path: &Path) {
        let dropped: Vec<u64> = self
            .paths
            .iter()
            .filter(|(_, mapped)| mapped.starts_with(path))
            .map(|(ino, _)| *ino)
            .collect();
        for ino in dropped {
            if let Some(mapped) = self.paths.remove(&ino) {
                self.inodes.remove(&mapped);
            }
        }
    }

    fn remap(&mut self, from: &Path, to: &Path) {
        self.forget_path(to);
        let moved: Vec<(u64, PathBuf)> = self
            .paths
            .iter()
            .filter(|(_, mapped)| mapped.starts_with(from))
            .map(|(ino, mapped)| (*ino, mapped.clone()))
            .collect();
        for (ino, old) in moved {
            let new = match old.strip_prefix(from) {
                Ok(rel) if rel.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rel) => to.join(rel),
                Err(_) => continue,
            };
            self.inodes.remove(&old);
            self.paths.insert(ino, new.clone());
            self.inodes.insert(new, ino);
        }
    }

    fn file_attr(&self, ino: u64, attrs: &Attributes) -> FileAttr {
        let kind = match attrs.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: attrs.atime.to_system(),
            mtime: attrs.mtime.to_system(),
            ctime: attrs.ctime.to_system(),
            crtime: attrs.ctime.to_system(),
            kind,
            perm: (attrs.mode & 0o7777) as u16,
            nlink: attrs.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn time_arg(value: Option<TimeOrNow>) -> Option<TimeSpec> {
    value.map(|value| match value {
        TimeOrNow::SpecificTime(time) => TimeSpec::from_system(time),
        TimeOrNow::Now => TimeSpec::now(),
    })
}

impl<V: Vfs + 'static> Filesystem for Mount<V> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        match self.vfs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attrs), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.vfs.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &self.file_attr(ino, &attrs)),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        if uid.is_some() || gid.is_some() {
            return reply.error(libc::EPERM);
        }
        if let Some(mode) = mode {
            if let Err(err) = self.vfs.chmod(&path, mode) {
                return reply.error(err.errno());
            }
        }
        if let Some(size) = size {
            if let Err(err) = self.vfs.truncate(&path, size) {
                return reply.error(err.errno());
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(err) = self.vfs.utimens(&path, time_arg(atime), time_arg(mtime)) {
                return reply.error(err.errno());
            }
        }
        match self.vfs.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &self.file_attr(ino, &attrs)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.vfs.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(err) => reply.error(err.errno()),
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
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        if let Err(err) = self.vfs.mkdir(&path, mode & !umask & 0o7777) {
            return reply.error(err.errno());
        }
        match self.vfs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attrs), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        match self.vfs.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        match self.vfs.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        if let Err(err) = self.vfs.symlink(target, &path) {
            return reply.error(err.errno());
        }
        match self.vfs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attrs), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        let from = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        let wire_flags = RenameFlags::from_raw(flags);
        match self.vfs.rename(&from, &to, wire_flags) {
            Ok(()) => {
                if wire_flags.is_exchange() {
                    // contents swapped under unchanged names; force
                    // fresh lookups below both
                    self.forget_path(&from);
                    self.forget_path(&to);
                } else {
                    self.remap(&from, &to);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.vfs.open(&path, OpenFlags::from_raw(flags as u32)) {
            Ok(handle) => reply.opened(handle.raw(), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let mut buf = vec![0u8; size as usize];
        match self
            .vfs
            .read(FileHandle::from_raw(fh), &mut buf, offset as u64)
        {
            Ok(count) => reply.data(&buf[..count]),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.vfs.write(FileHandle::from_raw(fh), data, offset as u64) {
            Ok(count) => reply.written(count as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Err(err) = self.vfs.close(FileHandle::from_raw(fh)) {
            trace!("release of fh:{fh} reported {err}");
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.get(parent).copied())
            .unwrap_or(ino);

        let mut listing: Vec<(PathBuf, FileType, String)> = Vec::new();
        let result = self.vfs.readdir(&path, &mut |name, attrs| {
            let kind = match attrs {
                Some(attrs) if attrs.is_dir() => FileType::Directory,
                Some(attrs) if attrs.is_symlink() => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            listing.push((path.join(name), kind, name.to_owned()));
        });
        if let Err(err) = result {
            return reply.error(err.errno());
        }

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent_ino, FileType::Directory, "..".to_owned()),
        ];
        for (child, kind, name) in listing {
            let child_ino = self.ino_for(&child);
            entries.push((child_ino, kind, name));
        }

        for (index, (entry_ino, kind, name)) in entries.into_iter().enumerate() {
            if (index as i64) < offset {
                continue;
            }
            if reply.add(entry_ino, index as i64 + 1, kind, &name) {
                break;
            }
        }
        reply.ok();
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
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err.errno()),
        };
        let handle = match self.vfs.create(
            &path,
            OpenFlags::from_raw(flags as u32),
            mode & !umask & 0o7777,
        ) {
            Ok(handle) => handle,
            Err(err) => return reply.error(err.errno()),
        };
        match self.vfs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.ino_for(&path);
                reply.created(&TTL, &self.file_attr(ino, &attrs), 0, handle.raw(), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }
}
