// Copyright © 2026 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode tetherfs wire frames.
// Author: Lukas Bower

//! Little-endian frame encoding. A frame is `[kind u8][id u64][fields]`;
//! the socket layer wraps it in a length prefix so one read consumes
//! exactly one frame. Strings carry a u16 length, byte buffers a u32
//! length, optional fields a one-byte presence flag.

use crate::proto::{
    Attributes, DirEntry, FileHandle, Frame, MessageId, OpenFlags, Payload, PayloadKind,
    PrereadResult, ReadResult, ReaddirResult, ReadlinkResult, RenameFlags, StatResult, TimeSpec,
    TreeNode, TreeResult, UnitResult, WriteResult,
};

/// Decode-side bound on attribute-tree nesting.
const MAX_TREE_DEPTH: usize = 64;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the declared structure was complete.
    #[error("truncated frame")]
    Truncated,
    /// Encountered an unknown payload kind tag.
    #[error("unknown payload kind {0}")]
    UnknownKind(u8),
    /// Encountered malformed UTF-8 in a string field.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// The frame carried bytes beyond its declared structure.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// Attribute tree nested deeper than the decoder allows.
    #[error("tree nesting too deep")]
    DepthExceeded,
}

/// Encode a frame into its wire representation.
#[must_use]
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(frame.payload.kind() as u8);
    buf.extend_from_slice(&frame.id.raw().to_le_bytes());
    match &frame.payload {
        Payload::Ping | Payload::Pong | Payload::NotifyChanged => {}
        Payload::ReadTree { path }
        | Payload::Stat { path }
        | Payload::Readdir { path }
        | Payload::Readlink { path }
        | Payload::Rmdir { path }
        | Payload::Unlink { path } => put_str(&mut buf, path),
        Payload::TreeResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            match &res.tree {
                Some(tree) => {
                    buf.push(1);
                    put_tree(&mut buf, tree);
                }
                None => buf.push(0),
            }
        }
        Payload::StatResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            put_opt_attrs(&mut buf, res.attrs.as_ref());
        }
        Payload::ReaddirResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            buf.extend_from_slice(&(res.entries.len() as u32).to_le_bytes());
            for entry in &res.entries {
                put_str(&mut buf, &entry.name);
                put_opt_attrs(&mut buf, entry.attrs.as_ref());
            }
        }
        Payload::ReadlinkResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            put_str(&mut buf, &res.target);
        }
        Payload::Mkdir { path, mode } | Payload::Chmod { path, mode } => {
            put_str(&mut buf, path);
            buf.extend_from_slice(&mode.to_le_bytes());
        }
        Payload::Symlink { target, link } => {
            put_str(&mut buf, target);
            put_str(&mut buf, link);
        }
        Payload::Rename { from, to, flags } => {
            put_str(&mut buf, from);
            put_str(&mut buf, to);
            buf.extend_from_slice(&flags.raw().to_le_bytes());
        }
        Payload::Utimens { path, atime, mtime } => {
            put_str(&mut buf, path);
            put_opt_time(&mut buf, atime.as_ref());
            put_opt_time(&mut buf, mtime.as_ref());
        }
        Payload::Truncate { path, length } => {
            put_str(&mut buf, path);
            buf.extend_from_slice(&length.to_le_bytes());
        }
        Payload::Open {
            path,
            handle,
            flags,
            mode,
        } => {
            put_str(&mut buf, path);
            buf.extend_from_slice(&handle.raw().to_le_bytes());
            buf.extend_from_slice(&flags.raw().to_le_bytes());
            match mode {
                Some(mode) => {
                    buf.push(1);
                    buf.extend_from_slice(&mode.to_le_bytes());
                }
                None => buf.push(0),
            }
        }
        Payload::Close { handle } => buf.extend_from_slice(&handle.raw().to_le_bytes()),
        Payload::Read {
            handle,
            offset,
            size,
        } => {
            buf.extend_from_slice(&handle.raw().to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
        }
        Payload::Write {
            handle,
            offset,
            data,
        } => {
            buf.extend_from_slice(&handle.raw().to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            put_bytes(&mut buf, data);
        }
        Payload::Preread { path, offset, size } => {
            put_str(&mut buf, path);
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
        }
        Payload::UnitResult(res) => buf.extend_from_slice(&res.err.to_le_bytes()),
        Payload::ReadResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            put_bytes(&mut buf, &res.data);
        }
        Payload::WriteResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            buf.extend_from_slice(&res.written.to_le_bytes());
        }
        Payload::PrereadResult(res) => {
            buf.extend_from_slice(&res.err.to_le_bytes());
            put_bytes(&mut buf, &res.data);
        }
    }
    buf
}

/// Decode a frame from its wire representation. The whole buffer must
/// be consumed; leftovers indicate a framing bug on the peer.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let kind = PayloadKind::try_from(cursor.read_u8()?)?;
    let id = MessageId::from_raw(cursor.read_u64()?);
    let payload = match kind {
        PayloadKind::Ping => Payload::Ping,
        PayloadKind::Pong => Payload::Pong,
        PayloadKind::NotifyChanged => Payload::NotifyChanged,
        PayloadKind::ReadTree => Payload::ReadTree {
            path: cursor.read_str()?,
        },
        PayloadKind::Stat => Payload::Stat {
            path: cursor.read_str()?,
        },
        PayloadKind::Readdir => Payload::Readdir {
            path: cursor.read_str()?,
        },
        PayloadKind::Readlink => Payload::Readlink {
            path: cursor.read_str()?,
        },
        PayloadKind::Rmdir => Payload::Rmdir {
            path: cursor.read_str()?,
        },
        PayloadKind::Unlink => Payload::Unlink {
            path: cursor.read_str()?,
        },
        PayloadKind::TreeResult => {
            let err = cursor.read_u32()?;
            let tree = if cursor.read_u8()? != 0 {
                Some(read_tree(&mut cursor, 0)?)
            } else {
                None
            };
            Payload::TreeResult(TreeResult { err, tree })
        }
        PayloadKind::StatResult => {
            let err = cursor.read_u32()?;
            let attrs = read_opt_attrs(&mut cursor)?;
            Payload::StatResult(StatResult { err, attrs })
        }
        PayloadKind::ReaddirResult => {
            let err = cursor.read_u32()?;
            let count = cursor.read_u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let name = cursor.read_str()?;
                let attrs = read_opt_attrs(&mut cursor)?;
                entries.push(DirEntry { name, attrs });
            }
            Payload::ReaddirResult(ReaddirResult { err, entries })
        }
        PayloadKind::ReadlinkResult => {
            let err = cursor.read_u32()?;
            let target = cursor.read_str()?;
            Payload::ReadlinkResult(ReadlinkResult { err, target })
        }
        PayloadKind::Mkdir => {
            let path = cursor.read_str()?;
            let mode = cursor.read_u32()?;
            Payload::Mkdir { path, mode }
        }
        PayloadKind::Chmod => {
            let path = cursor.read_str()?;
            let mode = cursor.read_u32()?;
            Payload::Chmod { path, mode }
        }
        PayloadKind::Symlink => {
            let target = cursor.read_str()?;
            let link = cursor.read_str()?;
            Payload::Symlink { target, link }
        }
        PayloadKind::Rename => {
            let from = cursor.read_str()?;
            let to = cursor.read_str()?;
            let flags = RenameFlags::from_raw(cursor.read_u32()?);
            Payload::Rename { from, to, flags }
        }
        PayloadKind::Utimens => {
            let path = cursor.read_str()?;
            let atime = read_opt_time(&mut cursor)?;
            let mtime = read_opt_time(&mut cursor)?;
            Payload::Utimens { path, atime, mtime }
        }
        PayloadKind::Truncate => {
            let path = cursor.read_str()?;
            let length = cursor.read_u64()?;
            Payload::Truncate { path, length }
        }
        PayloadKind::Open => {
            let path = cursor.read_str()?;
            let handle = FileHandle::from_raw(cursor.read_u64()?);
            let flags = OpenFlags::from_raw(cursor.read_u32()?);
            let mode = if cursor.read_u8()? != 0 {
                Some(cursor.read_u32()?)
            } else {
                None
            };
            Payload::Open {
                path,
                handle,
                flags,
                mode,
            }
        }
        PayloadKind::Close => Payload::Close {
            handle: FileHandle::from_raw(cursor.read_u64()?),
        },
        PayloadKind::Read => {
            let handle = FileHandle::from_raw(cursor.read_u64()?);
            let offset = cursor.read_u64()?;
            let size = cursor.read_u32()?;
            Payload::Read {
                handle,
                offset,
                size,
            }
        }
        PayloadKind::Write => {
            let handle = FileHandle::from_raw(cursor.read_u64()?);
            let offset = cursor.read_u64()?;
            let data = cursor.read_bytes()?;
            Payload::Write {
                handle,
                offset,
                data,
            }
        }
        PayloadKind::Preread => {
            let path = cursor.read_str()?;
            let offset = cursor.read_u64()?;
            let size = cursor.read_u32()?;
            Payload::Preread { path, offset, size }
        }
        PayloadKind::UnitResult => Payload::UnitResult(UnitResult {
            err: cursor.read_u32()?,
        }),
        PayloadKind::ReadResult => {
            let err = cursor.read_u32()?;
            let data = cursor.read_bytes()?;
            Payload::ReadResult(ReadResult { err, data })
        }
        PayloadKind::WriteResult => {
            let err = cursor.read_u32()?;
            let written = cursor.read_u32()?;
            Payload::WriteResult(WriteResult { err, written })
        }
        PayloadKind::PrereadResult => {
            let err = cursor.read_u32()?;
            let data = cursor.read_bytes()?;
            Payload::PrereadResult(PrereadResult { err, data })
        }
    };
    let remaining = cursor.remaining();
    if remaining != 0 {
        return Err(CodecError::TrailingBytes(remaining));
    }
    Ok(Frame { id, payload })
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    let len = value.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&value.as_bytes()[..len as usize]);
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn put_time(buf: &mut Vec<u8>, time: &TimeSpec) {
    buf.extend_from_slice(&time.sec.to_le_bytes());
    buf.extend_from_slice(&time.nsec.to_le_bytes());
}

fn put_opt_time(buf: &mut Vec<u8>, time: Option<&TimeSpec>) {
    match time {
        Some(time) => {
            buf.push(1);
            put_time(buf, time);
        }
        None => buf.push(0),
    }
}

fn put_attrs(buf: &mut Vec<u8>, attrs: &Attributes) {
    buf.extend_from_slice(&attrs.mode.to_le_bytes());
    buf.extend_from_slice(&attrs.nlink.to_le_bytes());
    buf.extend_from_slice(&attrs.size.to_le_bytes());
    put_time(buf, &attrs.atime);
    put_time(buf, &attrs.ctime);
    put_time(buf, &attrs.mtime);
}

fn put_opt_attrs(buf: &mut Vec<u8>, attrs: Option<&Attributes>) {
    match attrs {
        Some(attrs) => {
            buf.push(1);
            put_attrs(buf, attrs);
        }
        None => buf.push(0),
    }
}

fn put_tree(buf: &mut Vec<u8>, node: &TreeNode) {
    put_str(buf, &node.name);
    put_attrs(buf, &node.attrs);
    buf.extend_from_slice(&(node.children.len() as u32).to_le_bytes());
    for child in &node.children {
        put_tree(buf, child);
    }
}

fn read_opt_time(cursor: &mut Cursor<'_>) -> Result<Option<TimeSpec>, CodecError> {
    if cursor.read_u8()? == 0 {
        return Ok(None);
    }
    Ok(Some(read_time(cursor)?))
}

fn read_time(cursor: &mut Cursor<'_>) -> Result<TimeSpec, CodecError> {
    let sec = cursor.read_u64()? as i64;
    let nsec = cursor.read_u32()?;
    Ok(TimeSpec { sec, nsec })
}

fn read_attrs(cursor: &mut Cursor<'_>) -> Result<Attributes, CodecError> {
    let mode = cursor.read_u32()?;
    let nlink = cursor.read_u32()?;
    let size = cursor.read_u64()?;
    let atime = read_time(cursor)?;
    let ctime = read_time(cursor)?;
    let mtime = read_time(cursor)?;
    Ok(Attributes {
        mode,
        nlink,
        size,
        atime,
        ctime,
        mtime,
    })
}

fn read_opt_attrs(cursor: &mut Cursor<'_>) -> Result<Option<Attributes>, CodecError> {
    if cursor.read_u8()? == 0 {
        return Ok(None);
    }
    Ok(Some(read_attrs(cursor)?))
}

fn read_tree(cursor: &mut Cursor<'_>, depth: usize) -> Result<TreeNode, CodecError> {
    if depth > MAX_TREE_DEPTH {
        return Err(CodecError::DepthExceeded);
    }
    let name = cursor.read_str()?;
    let attrs = read_attrs(cursor)?;
    let count = cursor.read_u32()? as usize;
    let mut children = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        children.push(read_tree(cursor, depth + 1)?);
    }
    Ok(TreeNode {
        name,
        attrs,
        children,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let encoded = encode(&frame);
        let decoded = decode(&encoded).expect("decode frame");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_bare_payloads() {
        roundtrip(Frame {
            id: MessageId::from_raw(7),
            payload: Payload::Ping,
        });
        roundtrip(Frame {
            id: MessageId::from_raw(8),
            payload: Payload::Pong,
        });
        roundtrip(Frame {
            id: MessageId::UNSOLICITED,
            payload: Payload::NotifyChanged,
        });
    }

    #[test]
    fn roundtrip_open_with_and_without_mode() {
        roundtrip(Frame {
            id: MessageId::from_raw(1),
            payload: Payload::Open {
                path: "/a/b".into(),
                handle: FileHandle::from_raw(99),
                flags: OpenFlags::from_raw(libc::O_RDWR as u32),
                mode: Some(0o644),
            },
        });
        roundtrip(Frame {
            id: MessageId::from_raw(2),
            payload: Payload::Open {
                path: "/a/b".into(),
                handle: FileHandle::from_raw(100),
                flags: OpenFlags::from_raw(libc::O_RDONLY as u32),
                mode: None,
            },
        });
    }

    #[test]
    fn roundtrip_utimens_sentinels() {
        roundtrip(Frame {
            id: MessageId::from_raw(3),
            payload: Payload::Utimens {
                path: "/f".into(),
                atime: Some(TimeSpec { sec: 5, nsec: 250 }),
                mtime: None,
            },
        });
    }

    #[test]
    fn roundtrip_tree_result() {
        let tree = TreeNode {
            name: ".".into(),
            attrs: Attributes {
                mode: libc::S_IFDIR | 0o755,
                nlink: 2,
                size: 4096,
                ..Attributes::default()
            },
            children: vec![TreeNode {
                name: "leaf".into(),
                attrs: Attributes {
                    mode: libc::S_IFREG | 0o644,
                    nlink: 1,
                    size: 42,
                    mtime: TimeSpec { sec: 99, nsec: 7 },
                    ..Attributes::default()
                },
                children: Vec::new(),
            }],
        };
        roundtrip(Frame {
            id: MessageId::from_raw(4),
            payload: Payload::TreeResult(TreeResult {
                err: 0,
                tree: Some(tree),
            }),
        });
    }

    #[test]
    fn roundtrip_write_and_results() {
        roundtrip(Frame {
            id: MessageId::from_raw(5),
            payload: Payload::Write {
                handle: FileHandle::from_raw(11),
                offset: 1 << 40,
                data: vec![0, 1, 2, 255],
            },
        });
        roundtrip(Frame {
            id: MessageId::from_raw(6),
            payload: Payload::ReadResult(ReadResult {
                err: 0,
                data: vec![9; 100],
            }),
        });
        roundtrip(Frame {
            id: MessageId::from_raw(7),
            payload: Payload::UnitResult(UnitResult::fail(crate::proto::FsError::NotEmpty)),
        });
    }

    #[test]
    fn reject_unknown_kind() {
        let mut encoded = encode(&Frame {
            id: MessageId::from_raw(1),
            payload: Payload::Ping,
        });
        encoded[0] = 0xee;
        assert_eq!(decode(&encoded), Err(CodecError::UnknownKind(0xee)));
    }

    #[test]
    fn reject_truncated_frame() {
        let encoded = encode(&Frame {
            id: MessageId::from_raw(1),
            payload: Payload::Stat { path: "/x".into() },
        });
        assert_eq!(decode(&encoded[..encoded.len() - 1]), Err(CodecError::Truncated));
        assert_eq!(decode(&[]), Err(CodecError::Truncated));
    }

    #[test]
    fn reject_trailing_bytes() {
        let mut encoded = encode(&Frame {
            id: MessageId::from_raw(1),
            payload: Payload::Pong,
        });
        encoded.push(0);
        assert_eq!(decode(&encoded), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn reject_invalid_utf8() {
        let mut encoded = encode(&Frame {
            id: MessageId::from_raw(1),
            payload: Payload::Stat { path: "/ab".into() },
        });
        let len = encoded.len();
        encoded[len - 1] = 0xff;
        encoded[len - 2] = 0xfe;
        assert_eq!(decode(&encoded), Err(CodecError::InvalidUtf8));
    }
}
