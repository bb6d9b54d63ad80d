// Copyright © 2026 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the tetherfs wire data model shared by both endpoints.
// Author: Lukas Bower

//! Wire data model: frames, payloads, attribute records and error kinds.

pub mod codec;
pub mod compress;

use std::fmt;
use std::time::SystemTime;

/// Correlation identifier binding a reply to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u64);

impl MessageId {
    /// Identifier used by unsolicited frames such as change notices.
    pub const UNSOLICITED: MessageId = MessageId(0);

    /// Create a message identifier from the supplied raw value.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Access the raw identifier value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open-file identifier. The client chooses the value and the server
/// keys its open table by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

impl FileHandle {
    /// Create a file handle from the supplied raw value.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Access the raw handle value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
    /// Whole seconds.
    pub sec: i64,
    /// Nanosecond remainder, below one billion.
    pub nsec: u32,
}

impl TimeSpec {
    /// Capture the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    /// Convert from a system timestamp; times before the epoch clamp to
    /// the epoch.
    #[must_use]
    pub fn from_system(time: SystemTime) -> Self {
        match time.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Convert to a system timestamp.
    #[must_use]
    pub fn to_system(self) -> SystemTime {
        if self.sec >= 0 {
            SystemTime::UNIX_EPOCH + std::time::Duration::new(self.sec as u64, self.nsec)
        } else {
            SystemTime::UNIX_EPOCH
        }
    }
}

/// Stat-like record carried for every tree entry. Enough to answer a
/// stat call on the client without a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    /// File mode including the type bits.
    pub mode: u32,
    /// Hard-link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last access time.
    pub atime: TimeSpec,
    /// Last status change time.
    pub ctime: TimeSpec,
    /// Last modification time.
    pub mtime: TimeSpec,
}

impl Attributes {
    /// Check whether the entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Check whether the entry is a regular file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Check whether the entry is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name without any path components.
    pub name: String,
    /// Attributes, absent when the server could not stat the entry.
    pub attrs: Option<Attributes>,
}

/// Recursive attribute tree returned by the bulk tree read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Entry name; the served root reports ".".
    pub name: String,
    /// Attributes of the entry.
    pub attrs: Attributes,
    /// Child entries for directories.
    pub children: Vec<TreeNode>,
}

/// Rename behaviour selector carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenameFlags(u32);

impl RenameFlags {
    /// Fail with `Exists` when the target is present.
    pub const NO_REPLACE: RenameFlags = RenameFlags(1);
    /// Atomically swap the two entries.
    pub const EXCHANGE: RenameFlags = RenameFlags(2);

    /// Wrap a raw flag word.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Access the raw flag word.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Check the no-replace bit.
    #[must_use]
    pub fn is_no_replace(self) -> bool {
        self.0 & Self::NO_REPLACE.0 != 0
    }

    /// Check the exchange bit.
    #[must_use]
    pub fn is_exchange(self) -> bool {
        self.0 & Self::EXCHANGE.0 != 0
    }
}

/// POSIX-style open flag word as handed in by the kernel bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Wrap a raw flag word.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Access the raw flag word.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// A write-capable open needs a remote descriptor up front;
    /// read-only opens may defer it.
    #[must_use]
    pub fn is_write_capable(self) -> bool {
        let access = self.0 as i32 & libc::O_ACCMODE;
        access == libc::O_WRONLY
            || access == libc::O_RDWR
            || self.0 as i32 & libc::O_APPEND != 0
    }
}

/// Failure kinds surfaced by filesystem operations on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// No entry at the requested path.
    #[error("no such entry")]
    NotFound,
    /// An entry already occupies the target name.
    #[error("entry already exists")]
    Exists,
    /// Directory removal refused because children remain.
    #[error("directory not empty")]
    NotEmpty,
    /// The operation is not permitted on the target.
    #[error("access denied")]
    AccessDenied,
    /// Malformed argument, including ancestor exchanges.
    #[error("invalid argument")]
    Invalid,
    /// Unknown or already-closed file handle.
    #[error("bad file descriptor")]
    BadDescriptor,
    /// The request timed out or the link is down.
    #[error("remote host unreachable")]
    HostUnreachable,
    /// Underlying input/output failure.
    #[error("i/o failure")]
    IoError,
    /// A flag combination the server does not support.
    #[error("unsupported flag")]
    UnsupportedFlag,
}

impl FsError {
    /// Numeric wire representation; zero is reserved for success.
    #[must_use]
    pub fn wire_code(self) -> u32 {
        match self {
            Self::NotFound => 1,
            Self::Exists => 2,
            Self::NotEmpty => 3,
            Self::AccessDenied => 4,
            Self::Invalid => 5,
            Self::BadDescriptor => 6,
            Self::HostUnreachable => 7,
            Self::IoError => 8,
            Self::UnsupportedFlag => 9,
        }
    }

    /// Decode a wire code; unknown non-zero codes collapse to `IoError`
    /// so a newer peer cannot wedge an older one.
    #[must_use]
    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::NotFound),
            2 => Some(Self::Exists),
            3 => Some(Self::NotEmpty),
            4 => Some(Self::AccessDenied),
            5 => Some(Self::Invalid),
            6 => Some(Self::BadDescriptor),
            7 => Some(Self::HostUnreachable),
            9 => Some(Self::UnsupportedFlag),
            _ => Some(Self::IoError),
        }
    }

    /// Errno value for the kernel bridge.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::AccessDenied => libc::EACCES,
            Self::Invalid => libc::EINVAL,
            Self::BadDescriptor => libc::EBADF,
            Self::HostUnreachable => libc::EHOSTUNREACH,
            Self::IoError => libc::EIO,
            Self::UnsupportedFlag => libc::ENOTSUP,
        }
    }

    /// Classify an I/O failure from a syscall.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOENT => Self::NotFound,
            Some(code) if code == libc::EEXIST => Self::Exists,
            Some(code) if code == libc::ENOTEMPTY => Self::NotEmpty,
            Some(code) if code == libc::EACCES || code == libc::EPERM => Self::AccessDenied,
            Some(code) if code == libc::EINVAL => Self::Invalid,
            Some(code) if code == libc::EBADF => Self::BadDescriptor,
            Some(_) => Self::IoError,
            None => match err.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound,
                std::io::ErrorKind::AlreadyExists => Self::Exists,
                std::io::ErrorKind::PermissionDenied => Self::AccessDenied,
                std::io::ErrorKind::InvalidInput => Self::Invalid,
                _ => Self::IoError,
            },
        }
    }
}

/// Turn an embedded wire error code into an operation result.
pub fn wire_err(code: u32) -> Result<(), FsError> {
    match FsError::from_wire_code(code) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Payload kind tags as they appear on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Ping = 1,
    Pong = 2,
    ReadTree = 3,
    TreeResult = 4,
    Stat = 5,
    StatResult = 6,
    Readdir = 7,
    ReaddirResult = 8,
    Readlink = 9,
    ReadlinkResult = 10,
    Mkdir = 11,
    Rmdir = 12,
    Unlink = 13,
    Symlink = 14,
    Rename = 15,
    Chmod = 16,
    Utimens = 17,
    Truncate = 18,
    Open = 19,
    Close = 20,
    Read = 21,
    Write = 22,
    Preread = 23,
    UnitResult = 24,
    ReadResult = 25,
    WriteResult = 26,
    PrereadResult = 27,
    NotifyChanged = 28,
}

impl TryFrom<u8> for PayloadKind {
    type Error = codec::CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use PayloadKind::*;
        Ok(match value {
            1 => Ping,
            2 => Pong,
            3 => ReadTree,
            4 => TreeResult,
            5 => Stat,
            6 => StatResult,
            7 => Readdir,
            8 => ReaddirResult,
            9 => Readlink,
            10 => ReadlinkResult,
            11 => Mkdir,
            12 => Rmdir,
            13 => Unlink,
            14 => Symlink,
            15 => Rename,
            16 => Chmod,
            17 => Utimens,
            18 => Truncate,
            19 => Open,
            20 => Close,
            21 => Read,
            22 => Write,
            23 => Preread,
            24 => UnitResult,
            25 => ReadResult,
            26 => WriteResult,
            27 => PrereadResult,
            28 => NotifyChanged,
            other => return Err(codec::CodecError::UnknownKind(other)),
        })
    }
}

/// Reply to the heartbeat ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pong;

/// Reply to the bulk tree read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Attribute tree of the requested subtree.
    pub tree: Option<TreeNode>,
}

/// Reply to a stat command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Attributes on success.
    pub attrs: Option<Attributes>,
}

/// Reply to a directory listing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Directory entries on success.
    pub entries: Vec<DirEntry>,
}

/// Reply to a readlink command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadlinkResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Link target on success.
    pub target: String,
}

/// Reply carrying only a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitResult {
    /// Wire error code, zero on success.
    pub err: u32,
}

impl UnitResult {
    /// Successful unit reply.
    #[must_use]
    pub fn ok() -> Self {
        Self { err: 0 }
    }

    /// Failed unit reply.
    #[must_use]
    pub fn fail(err: FsError) -> Self {
        Self {
            err: err.wire_code(),
        }
    }
}

/// Reply to a handle-based read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Bytes read; shorter than requested at end of file.
    pub data: Vec<u8>,
}

/// Reply to a handle-based write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Bytes written.
    pub written: u32,
}

/// Reply to a path-based preread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrereadResult {
    /// Wire error code, zero on success.
    pub err: u32,
    /// Bytes read.
    pub data: Vec<u8>,
}

/// The closed payload set carried by frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Fetch the whole attribute tree below `path`.
    ReadTree {
        /// Subtree root in the served namespace.
        path: String,
    },
    /// Reply to `ReadTree`.
    TreeResult(TreeResult),
    /// Stat one entry.
    Stat {
        /// Entry path.
        path: String,
    },
    /// Reply to `Stat`.
    StatResult(StatResult),
    /// List a directory.
    Readdir {
        /// Directory path.
        path: String,
    },
    /// Reply to `Readdir`.
    ReaddirResult(ReaddirResult),
    /// Resolve a symbolic link.
    Readlink {
        /// Link path.
        path: String,
    },
    /// Reply to `Readlink`.
    ReadlinkResult(ReadlinkResult),
    /// Create a directory.
    Mkdir {
        /// Directory path.
        path: String,
        /// Permission bits.
        mode: u32,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Directory path.
        path: String,
    },
    /// Remove a file or symlink.
    Unlink {
        /// Entry path.
        path: String,
    },
    /// Create a symbolic link.
    Symlink {
        /// Link target as stored in the link.
        target: String,
        /// Path of the new link.
        link: String,
    },
    /// Rename or exchange two entries.
    Rename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
        /// Behaviour selector.
        flags: RenameFlags,
    },
    /// Change permission bits.
    Chmod {
        /// Entry path.
        path: String,
        /// New permission bits.
        mode: u32,
    },
    /// Update timestamps; an absent field is left unchanged.
    Utimens {
        /// Entry path.
        path: String,
        /// New access time.
        atime: Option<TimeSpec>,
        /// New modification time.
        mtime: Option<TimeSpec>,
    },
    /// Truncate a file to the given length.
    Truncate {
        /// File path.
        path: String,
        /// New length in bytes.
        length: u64,
    },
    /// Open or create a file under a client-chosen handle. A present
    /// mode distinguishes create from plain open.
    Open {
        /// File path.
        path: String,
        /// Client-chosen handle the server keys its table by.
        handle: FileHandle,
        /// Open flag word.
        flags: OpenFlags,
        /// Creation mode when creating.
        mode: Option<u32>,
    },
    /// Close a handle.
    Close {
        /// Handle to close.
        handle: FileHandle,
    },
    /// Read a range through an open handle.
    Read {
        /// Open handle.
        handle: FileHandle,
        /// Byte offset.
        offset: u64,
        /// Bytes requested.
        size: u32,
    },
    /// Write a range through an open handle.
    Write {
        /// Open handle.
        handle: FileHandle,
        /// Byte offset.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Read a range by path without an open handle, used by the
    /// background preloader.
    Preread {
        /// File path.
        path: String,
        /// Byte offset.
        offset: u64,
        /// Bytes requested.
        size: u32,
    },
    /// Reply carrying only a status code.
    UnitResult(UnitResult),
    /// Reply to `Read`.
    ReadResult(ReadResult),
    /// Reply to `Write`.
    WriteResult(WriteResult),
    /// Reply to `Preread`.
    PrereadResult(PrereadResult),
    /// Unsolicited notice that the served directory changed.
    NotifyChanged,
}

impl Payload {
    /// Wire tag of this payload.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Ping => PayloadKind::Ping,
            Self::Pong => PayloadKind::Pong,
            Self::ReadTree { .. } => PayloadKind::ReadTree,
            Self::TreeResult(_) => PayloadKind::TreeResult,
            Self::Stat { .. } => PayloadKind::Stat,
            Self::StatResult(_) => PayloadKind::StatResult,
            Self::Readdir { .. } => PayloadKind::Readdir,
            Self::ReaddirResult(_) => PayloadKind::ReaddirResult,
            Self::Readlink { .. } => PayloadKind::Readlink,
            Self::ReadlinkResult(_) => PayloadKind::ReadlinkResult,
            Self::Mkdir { .. } => PayloadKind::Mkdir,
            Self::Rmdir { .. } => PayloadKind::Rmdir,
            Self::Unlink { .. } => PayloadKind::Unlink,
            Self::Symlink { .. } => PayloadKind::Symlink,
            Self::Rename { .. } => PayloadKind::Rename,
            Self::Chmod { .. } => PayloadKind::Chmod,
            Self::Utimens { .. } => PayloadKind::Utimens,
            Self::Truncate { .. } => PayloadKind::Truncate,
            Self::Open { .. } => PayloadKind::Open,
            Self::Close { .. } => PayloadKind::Close,
            Self::Read { .. } => PayloadKind::Read,
            Self::Write { .. } => PayloadKind::Write,
            Self::Preread { .. } => PayloadKind::Preread,
            Self::UnitResult(_) => PayloadKind::UnitResult,
            Self::ReadResult(_) => PayloadKind::ReadResult,
            Self::WriteResult(_) => PayloadKind::WriteResult,
            Self::PrereadResult(_) => PayloadKind::PrereadResult,
            Self::NotifyChanged => PayloadKind::NotifyChanged,
        }
    }
}

/// One wire message: a correlation identifier plus a typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation identifier.
    pub id: MessageId,
    /// Typed payload.
    pub payload: Payload,
}

/// Typed extraction of an expected reply payload. A waiter only
/// consumes frames whose payload kind matches its expectation.
pub trait ReplyPayload: Sized {
    /// Payload kind this reply type corresponds to.
    const KIND: PayloadKind;

    /// Extract the reply from a payload of the matching kind.
    fn from_payload(payload: Payload) -> Option<Self>;
}

impl ReplyPayload for Pong {
    const KIND: PayloadKind = PayloadKind::Pong;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::Pong => Some(Pong),
            _ => None,
        }
    }
}

impl ReplyPayload for TreeResult {
    const KIND: PayloadKind = PayloadKind::TreeResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::TreeResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for StatResult {
    const KIND: PayloadKind = PayloadKind::StatResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::StatResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for ReaddirResult {
    const KIND: PayloadKind = PayloadKind::ReaddirResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::ReaddirResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for ReadlinkResult {
    const KIND: PayloadKind = PayloadKind::ReadlinkResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::ReadlinkResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for UnitResult {
    const KIND: PayloadKind = PayloadKind::UnitResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::UnitResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for ReadResult {
    const KIND: PayloadKind = PayloadKind::ReadResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::ReadResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for WriteResult {
    const KIND: PayloadKind = PayloadKind::WriteResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::WriteResult(res) => Some(res),
            _ => None,
        }
    }
}

impl ReplyPayload for PrereadResult {
    const KIND: PayloadKind = PayloadKind::PrereadResult;

    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::PrereadResult(res) => Some(res),
            _ => None,
        }
    }
}
