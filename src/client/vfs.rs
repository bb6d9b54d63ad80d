// CLASSIFICATION: COMMUNITY
// Filename: vfs.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-07-27

//! The filesystem-operations contract and its stateless remote
//! implementation. Every `RemoteVfs` method is one command/reply round
//! trip; large reads and writes are fragmented so other traffic can
//! interleave on a slow link.

use std::path::{Path, PathBuf};

use std::sync::Arc;

use log::trace;

use crate::proto::{
    wire_err, Attributes, FileHandle, FsError, OpenFlags, Payload, ReadResult, ReaddirResult,
    ReadlinkResult, RenameFlags, ReplyPayload, StatResult, TimeSpec, UnitResult, WriteResult,
};
use crate::relay::{IdGen, Priority, ReplyTable, Scheduler};
use crate::{IO_FRAGMENT_SIZE, REQUEST_TIMEOUT};

/// Callback receiving directory entries one at a time.
pub type DirSink<'a> = &'a mut dyn FnMut(&str, Option<&Attributes>);

/// The operation set shared by the caching layer and the remote
/// wrapper. The kernel bridge talks to exactly one implementor.
pub trait Vfs: Send + Sync {
    /// Stat one entry.
    fn getattr(&self, path: &Path) -> Result<Attributes, FsError>;
    /// List a directory into the sink.
    fn readdir(&self, path: &Path, sink: DirSink<'_>) -> Result<(), FsError>;
    /// Resolve a symbolic link.
    fn readlink(&self, path: &Path) -> Result<PathBuf, FsError>;
    /// Create a directory.
    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), FsError>;
    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> Result<(), FsError>;
    /// Remove a file or symlink.
    fn unlink(&self, path: &Path) -> Result<(), FsError>;
    /// Create a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError>;
    /// Rename or exchange two entries.
    fn rename(&self, from: &Path, to: &Path, flags: RenameFlags) -> Result<(), FsError>;
    /// Change permission bits.
    fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError>;
    /// Update timestamps; `None` leaves a time unchanged.
    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> Result<(), FsError>;
    /// Truncate a file.
    fn truncate(&self, path: &Path, length: u64) -> Result<(), FsError>;
    /// Create and open a file.
    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<FileHandle, FsError>;
    /// Open an existing file.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, FsError>;
    /// Close an open handle.
    fn close(&self, handle: FileHandle) -> Result<(), FsError>;
    /// Read into `out` at `offset`; returns the byte count.
    fn read(&self, handle: FileHandle, out: &mut [u8], offset: u64) -> Result<usize, FsError>;
    /// Write `data` at `offset`; returns the byte count.
    fn write(&self, handle: FileHandle, data: &[u8], offset: u64) -> Result<usize, FsError>;
}

/// Stateless remote implementor: every call is encoded, sent on a fresh
/// default-priority queue and awaited by correlation identifier.
pub struct RemoteVfs {
    scheduler: Arc<Scheduler>,
    replies: Arc<ReplyTable>,
    handle_ids: IdGen,
}

impl RemoteVfs {
    /// Wrap the shared transport pieces.
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, replies: Arc<ReplyTable>) -> Self {
        Self {
            scheduler,
            replies,
            handle_ids: IdGen::seeded(),
        }
    }

    fn round_trip<T: ReplyPayload>(&self, payload: Payload) -> Result<T, FsError> {
        let queue = self.scheduler.open_queue(Priority::DEFAULT);
        let mid = queue.push(payload);
        trace!("mid:{mid} sent");
        self.replies
            .wait::<T>(mid, REQUEST_TIMEOUT)
            .ok_or(FsError::HostUnreachable)
    }

    fn unit_command(&self, payload: Payload) -> Result<(), FsError> {
        let res: UnitResult = self.round_trip(payload)?;
        wire_err(res.err)
    }

    fn open_common(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: Option<u32>,
    ) -> Result<FileHandle, FsError> {
        let handle = FileHandle::from_raw(self.handle_ids.next());
        self.unit_command(Payload::Open {
            path: wire_path(path)?,
            handle,
            flags,
            mode,
        })?;
        trace!("opened fh:{handle} for {}", path.display());
        Ok(handle)
    }
}

impl Vfs for RemoteVfs {
    fn getattr(&self, path: &Path) -> Result<Attributes, FsError> {
        let res: StatResult = self.round_trip(Payload::Stat {
            path: wire_path(path)?,
        })?;
        wire_err(res.err)?;
        res.attrs.ok_or(FsError::IoError)
    }

    fn readdir(&self, path: &Path, sink: DirSink<'_>) -> Result<(), FsError> {
        let res: ReaddirResult = self.round_trip(Payload::Readdir {
            path: wire_path(path)?,
        })?;
        wire_err(res.err)?;
        for entry in &res.entries {
            sink(&entry.name, entry.attrs.as_ref());
        }
        Ok(())
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, FsError> {
        let res: ReadlinkResult = self.round_trip(Payload::Readlink {
            path: wire_path(path)?,
        })?;
        wire_err(res.err)?;
        Ok(PathBuf::from(res.target))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.unit_command(Payload::Mkdir {
            path: wire_path(path)?,
            mode,
        })
    }

    fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        self.unit_command(Payload::Rmdir {
            path: wire_path(path)?,
        })
    }

    fn unlink(&self, path: &Path) -> Result<(), FsError> {
        self.unit_command(Payload::Unlink {
            path: wire_path(path)?,
        })
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError> {
        self.unit_command(Payload::Symlink {
            target: wire_path(target)?,
            link: wire_path(link)?,
        })
    }

    fn rename(&self, from: &Path, to: &Path, flags: RenameFlags) -> Result<(), FsError> {
        self.unit_command(Payload::Rename {
            from: wire_path(from)?,
            to: wire_path(to)?,
            flags,
        })
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.unit_command(Payload::Chmod {
            path: wire_path(path)?,
            mode,
        })
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> Result<(), FsError> {
        self.unit_command(Payload::Utimens {
            path: wire_path(path)?,
            atime,
            mtime,
        })
    }

    fn truncate(&self, path: &Path, length: u64) -> Result<(), FsError> {
        self.unit_command(Payload::Truncate {
            path: wire_path(path)?,
            length,
        })
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<FileHandle, FsError> {
        self.open_common(path, flags, Some(mode))
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, FsError> {
        self.open_common(path, flags, None)
    }

    fn close(&self, handle: FileHandle) -> Result<(), FsError> {
        self.unit_command(Payload::Close { handle })
    }

    fn read(&self, handle: FileHandle, out: &mut [u8], offset: u64) -> Result<usize, FsError> {
        if out.is_empty() {
            return Ok(0);
        }
        // queue every fragment before awaiting any reply
        let queue = self.scheduler.open_queue(Priority::DEFAULT);
        let mut pending = Vec::with_capacity(out.len() / IO_FRAGMENT_SIZE + 1);
        let mut from = 0usize;
        while from < out.len() {
            let len = (out.len() - from).min(IO_FRAGMENT_SIZE);
            let mid = queue.push(Payload::Read {
                handle,
                offset: offset + from as u64,
                size: len as u32,
            });
            pending.push((mid, from, len));
            from += len;
        }

        let mut total = 0usize;
        for (mid, from, len) in pending {
            let res: ReadResult = self
                .replies
                .wait(mid, REQUEST_TIMEOUT)
                .ok_or(FsError::HostUnreachable)?;
            wire_err(res.err)?;
            if res.data.len() > len {
                return Err(FsError::IoError);
            }
            out[from..from + res.data.len()].copy_from_slice(&res.data);
            total = from + res.data.len();
            if res.data.len() < len {
                // end of file; later fragments are past it
                break;
            }
        }
        Ok(total)
    }

    fn write(&self, handle: FileHandle, data: &[u8], offset: u64) -> Result<usize, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let queue = self.scheduler.open_queue(Priority::DEFAULT);
        let mut pending = Vec::with_capacity(data.len() / IO_FRAGMENT_SIZE + 1);
        let mut from = 0usize;
        while from < data.len() {
            let len = (data.len() - from).min(IO_FRAGMENT_SIZE);
            let mid = queue.push(Payload::Write {
                handle,
                offset: offset + from as u64,
                data: data[from..from + len].to_vec(),
            });
            pending.push((mid, len));
            from += len;
        }

        let mut total = 0usize;
        for (mid, len) in pending {
            let res: WriteResult = self
                .replies
                .wait(mid, REQUEST_TIMEOUT)
                .ok_or(FsError::HostUnreachable)?;
            wire_err(res.err)?;
            total += res.written as usize;
            if (res.written as usize) < len {
                break;
            }
        }
        Ok(total)
    }
}

/// Convert a client path to its wire form.
pub fn wire_path(path: &Path) -> Result<String, FsError> {
    path.to_str().map(str::to_owned).ok_or(FsError::Invalid)
}
