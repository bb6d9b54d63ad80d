// CLASSIFICATION: COMMUNITY
// Filename: worker.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Request dispatcher for the served directory: a pool of threads
//! draining the inbound queue, one handler per command kind, and the
//! open-file table keyed by the client-chosen handle. Every mutating
//! handler records its target in the ignore set before touching the
//! disk so the watcher stays quiet about it.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::Receiver;
use log::{trace, warn};

use crate::proto::{
    codec, Attributes, DirEntry, FileHandle, Frame, FsError, MessageId, OpenFlags, Payload,
    PayloadKind, PrereadResult, ReadResult, ReaddirResult, ReadlinkResult, RenameFlags,
    StatResult, TimeSpec, TreeNode, TreeResult, UnitResult, WriteResult,
};
use crate::relay::Dispatcher;
use crate::server::link::ServerLink;
use crate::server::paths::map_path;
use crate::server::watcher::TemporalIgnores;

/// Bound on tree-read recursion; loops through bind mounts would
/// otherwise walk forever.
const MAX_TREE_DEPTH: usize = 64;

/// Suffix for the temporary name used while emulating an exchange.
const EXCHANGE_SUFFIX: &str = ".tetherfs-xchg";

struct OpenEntry {
    /// Wire path, kept for ignore-set bookkeeping on write and close.
    path: String,
    io: Mutex<File>,
}

struct WorkerShared {
    root: PathBuf,
    link: Arc<ServerLink>,
    ignores: Arc<TemporalIgnores>,
    files: Mutex<HashMap<u64, Arc<OpenEntry>>>,
}

impl WorkerShared {
    fn ignore(&self, wire: &str) {
        self.ignores.add(Instant::now(), PathBuf::from(wire));
    }

    fn send_reply(&self, id: MessageId, payload: Payload) {
        trace!("reply mid:{id}");
        let frame = codec::encode(&Frame { id, payload });
        self.link.send(&frame);
    }

    fn lookup(&self, handle: FileHandle) -> Option<Arc<OpenEntry>> {
        self.files.lock().unwrap().get(&handle.raw()).cloned()
    }
}

/// The worker pool.
pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    inbound: Receiver<Vec<u8>>,
    count: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Pool of `count` threads serving `root`.
    #[must_use]
    pub fn new(
        root: PathBuf,
        link: Arc<ServerLink>,
        ignores: Arc<TemporalIgnores>,
        inbound: Receiver<Vec<u8>>,
        count: usize,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            root,
            link,
            ignores,
            files: Mutex::new(HashMap::new()),
        });

        let mut dispatcher = Dispatcher::new();
        subscribe_handlers(&mut dispatcher, &shared);

        Self {
            dispatcher: Arc::new(dispatcher),
            inbound,
            count,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start the pool; threads exit when the inbound queue closes.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        for index in 0..self.count {
            let dispatcher = Arc::clone(&self.dispatcher);
            let inbound = self.inbound.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tetherfs-worker-{index}"))
                .spawn(move || {
                    while let Ok(frame) = inbound.recv() {
                        dispatcher.dispatch(&frame);
                    }
                })
                .expect("spawn worker thread");
            threads.push(handle);
        }
    }

    /// Join every pool thread.
    pub fn join(&self) {
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn subscribe_handlers(dispatcher: &mut Dispatcher, shared: &Arc<WorkerShared>) {
    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Ping, move |mid, _payload| {
        sh.send_reply(mid, Payload::Pong);
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::ReadTree, move |mid, payload| {
        if let Payload::ReadTree { path } = payload {
            let reply = read_tree_reply(&sh, &path);
            sh.send_reply(mid, Payload::TreeResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Stat, move |mid, payload| {
        if let Payload::Stat { path } = payload {
            let reply = stat_reply(&sh, &path);
            sh.send_reply(mid, Payload::StatResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Readdir, move |mid, payload| {
        if let Payload::Readdir { path } = payload {
            let reply = readdir_reply(&sh, &path);
            sh.send_reply(mid, Payload::ReaddirResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Readlink, move |mid, payload| {
        if let Payload::Readlink { path } = payload {
            let reply = readlink_reply(&sh, &path);
            sh.send_reply(mid, Payload::ReadlinkResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Mkdir, move |mid, payload| {
        if let Payload::Mkdir { path, mode } = payload {
            sh.ignore(&path);
            let reply = unit_reply(map_path(&sh.root, &path).and_then(|local| {
                fs::DirBuilder::new()
                    .mode(mode & 0o7777)
                    .create(local)
                    .map_err(io_kind)
            }));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Rmdir, move |mid, payload| {
        if let Payload::Rmdir { path } = payload {
            sh.ignore(&path);
            let reply = unit_reply(
                map_path(&sh.root, &path)
                    .and_then(|local| fs::remove_dir(local).map_err(io_kind)),
            );
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Unlink, move |mid, payload| {
        if let Payload::Unlink { path } = payload {
            sh.ignore(&path);
            let reply = unit_reply(
                map_path(&sh.root, &path)
                    .and_then(|local| fs::remove_file(local).map_err(io_kind)),
            );
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Symlink, move |mid, payload| {
        if let Payload::Symlink { target, link } = payload {
            sh.ignore(&link);
            let reply = unit_reply(map_path(&sh.root, &link).and_then(|local| {
                std::os::unix::fs::symlink(Path::new(&target), local).map_err(io_kind)
            }));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Rename, move |mid, payload| {
        if let Payload::Rename { from, to, flags } = payload {
            sh.ignore(&from);
            sh.ignore(&to);
            let reply = unit_reply(rename_local(&sh, &from, &to, flags));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Chmod, move |mid, payload| {
        if let Payload::Chmod { path, mode } = payload {
            sh.ignore(&path);
            let reply = unit_reply(map_path(&sh.root, &path).and_then(|local| {
                fs::set_permissions(local, fs::Permissions::from_mode(mode)).map_err(io_kind)
            }));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Utimens, move |mid, payload| {
        if let Payload::Utimens { path, atime, mtime } = payload {
            sh.ignore(&path);
            let reply = unit_reply(utimens_local(&sh, &path, atime, mtime));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Truncate, move |mid, payload| {
        if let Payload::Truncate { path, length } = payload {
            sh.ignore(&path);
            let reply = unit_reply(map_path(&sh.root, &path).and_then(|local| {
                OpenOptions::new()
                    .write(true)
                    .open(local)
                    .and_then(|file| file.set_len(length))
                    .map_err(io_kind)
            }));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Open, move |mid, payload| {
        if let Payload::Open {
            path,
            handle,
            flags,
            mode,
        } = payload
        {
            sh.ignore(&path);
            let reply = unit_reply(open_local(&sh, &path, handle, flags, mode));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Close, move |mid, payload| {
        if let Payload::Close { handle } = payload {
            let reply = unit_reply(close_local(&sh, handle));
            sh.send_reply(mid, Payload::UnitResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Read, move |mid, payload| {
        if let Payload::Read {
            handle,
            offset,
            size,
        } = payload
        {
            let reply = read_reply(&sh, handle, offset, size);
            sh.send_reply(mid, Payload::ReadResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Write, move |mid, payload| {
        if let Payload::Write {
            handle,
            offset,
            data,
        } = payload
        {
            let reply = write_reply(&sh, handle, offset, &data);
            sh.send_reply(mid, Payload::WriteResult(reply));
        }
    });

    let sh = Arc::clone(shared);
    dispatcher.subscribe(PayloadKind::Preread, move |mid, payload| {
        if let Payload::Preread { path, offset, size } = payload {
            let reply = preread_reply(&sh, &path, offset, size);
            sh.send_reply(mid, Payload::PrereadResult(reply));
        }
    });
}

fn io_kind(err: std::io::Error) -> FsError {
    FsError::from_io(&err)
}

fn unit_reply(result: Result<(), FsError>) -> UnitResult {
    match result {
        Ok(()) => UnitResult::ok(),
        Err(err) => UnitResult::fail(err),
    }
}

fn attrs_from_metadata(meta: &fs::Metadata) -> Attributes {
    Attributes {
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        size: meta.size(),
        atime: TimeSpec {
            sec: meta.atime(),
            nsec: meta.atime_nsec() as u32,
        },
        ctime: TimeSpec {
            sec: meta.ctime(),
            nsec: meta.ctime_nsec() as u32,
        },
        mtime: TimeSpec {
            sec: meta.mtime(),
            nsec: meta.mtime_nsec() as u32,
        },
    }
}

fn stat_reply(shared: &WorkerShared, path: &str) -> StatResult {
    let local = match map_path(&shared.root, path) {
        Ok(local) => local,
        Err(err) => {
            return StatResult {
                err: err.wire_code(),
                attrs: None,
            }
        }
    };
    match fs::symlink_metadata(&local) {
        Ok(meta) => StatResult {
            err: 0,
            attrs: Some(attrs_from_metadata(&meta)),
        },
        Err(err) => StatResult {
            err: io_kind(err).wire_code(),
            attrs: None,
        },
    }
}

fn readdir_reply(shared: &WorkerShared, path: &str) -> ReaddirResult {
    let fail = |err: FsError| ReaddirResult {
        err: err.wire_code(),
        entries: Vec::new(),
    };
    let local = match map_path(&shared.root, path) {
        Ok(local) => local,
        Err(err) => return fail(err),
    };
    let reader = match fs::read_dir(&local) {
        Ok(reader) => reader,
        Err(err) => return fail(io_kind(err)),
    };
    let mut entries = Vec::new();
    for entry in reader {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => return fail(io_kind(err)),
        };
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping non-utf8 entry under {}", local.display());
            continue;
        };
        let attrs = fs::symlink_metadata(entry.path())
            .ok()
            .map(|meta| attrs_from_metadata(&meta));
        entries.push(DirEntry { name, attrs });
    }
    ReaddirResult { err: 0, entries }
}

fn readlink_reply(shared: &WorkerShared, path: &str) -> ReadlinkResult {
    let fail = |err: FsError| ReadlinkResult {
        err: err.wire_code(),
        target: String::new(),
    };
    let local = match map_path(&shared.root, path) {
        Ok(local) => local,
        Err(err) => return fail(err),
    };
    match fs::read_link(&local) {
        Ok(target) => match target.to_str() {
            Some(target) => ReadlinkResult {
                err: 0,
                target: target.to_owned(),
            },
            None => fail(FsError::Invalid),
        },
        Err(err) => fail(io_kind(err)),
    }
}

fn read_tree_reply(shared: &WorkerShared, path: &str) -> TreeResult {
    let local = match map_path(&shared.root, path) {
        Ok(local) => local,
        Err(err) => {
            return TreeResult {
                err: err.wire_code(),
                tree: None,
            }
        }
    };
    trace!("read tree below {}", local.display());
    let tree = build_tree(&local, 0);
    TreeResult {
        err: 0,
        tree: Some(tree),
    }
}

fn build_tree(local: &Path, depth: usize) -> TreeNode {
    let name = if depth == 0 {
        ".".to_owned()
    } else {
        local
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("?")
            .to_owned()
    };
    let attrs = match fs::symlink_metadata(local) {
        Ok(meta) => attrs_from_metadata(&meta),
        Err(err) => {
            warn!("stat of {} failed: {err}", local.display());
            Attributes::default()
        }
    };
    let mut children = Vec::new();
    if attrs.is_dir() && depth < MAX_TREE_DEPTH {
        match fs::read_dir(local) {
            Ok(reader) => {
                for entry in reader.flatten() {
                    if entry.file_name().to_str().is_none() {
                        continue;
                    }
                    children.push(build_tree(&entry.path(), depth + 1));
                }
            }
            Err(err) => warn!("listing {} failed: {err}", local.display()),
        }
    }
    TreeNode {
        name,
        attrs,
        children,
    }
}

fn rename_local(
    shared: &WorkerShared,
    from: &str,
    to: &str,
    flags: RenameFlags,
) -> Result<(), FsError> {
    let from_local = map_path(&shared.root, from)?;
    let to_local = map_path(&shared.root, to)?;
    if flags.is_exchange() {
        return exchange_local(&from_local, &to_local);
    }
    if flags.is_no_replace() && fs::symlink_metadata(&to_local).is_ok() {
        return Err(FsError::Exists);
    }
    fs::rename(&from_local, &to_local).map_err(io_kind)
}

/// Exchange through a temporary sibling name. Not crash-atomic; a
/// crash between the renames leaves the temporary name behind.
fn exchange_local(from: &Path, to: &Path) -> Result<(), FsError> {
    fs::symlink_metadata(from).map_err(io_kind)?;
    fs::symlink_metadata(to).map_err(io_kind)?;

    let mut parked = from.as_os_str().to_owned();
    parked.push(EXCHANGE_SUFFIX);
    let parked = PathBuf::from(parked);

    fs::rename(from, &parked).map_err(io_kind)?;
    if let Err(err) = fs::rename(to, from) {
        let _ = fs::rename(&parked, from);
        return Err(io_kind(err));
    }
    fs::rename(&parked, to).map_err(io_kind)
}

fn utimens_local(
    shared: &WorkerShared,
    path: &str,
    atime: Option<TimeSpec>,
    mtime: Option<TimeSpec>,
) -> Result<(), FsError> {
    let local = map_path(&shared.root, path)?;
    let c_path =
        CString::new(local.as_os_str().as_bytes()).map_err(|_| FsError::Invalid)?;
    let spec = |value: Option<TimeSpec>| match value {
        Some(time) => libc::timespec {
            tv_sec: time.sec,
            tv_nsec: libc::c_long::from(time.nsec),
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    };
    let times = [spec(atime), spec(mtime)];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io_kind(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn open_local(
    shared: &WorkerShared,
    path: &str,
    handle: FileHandle,
    flags: OpenFlags,
    mode: Option<u32>,
) -> Result<(), FsError> {
    let local = map_path(&shared.root, path)?;
    let raw = flags.raw() as i32;
    let access = raw & libc::O_ACCMODE;

    let mut options = OpenOptions::new();
    options.read(access == libc::O_RDONLY || access == libc::O_RDWR);
    options.write(access == libc::O_WRONLY || access == libc::O_RDWR);
    if raw & libc::O_APPEND != 0 {
        options.append(true);
    }
    if raw & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    if let Some(mode) = mode {
        if raw & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        options.mode(mode);
    }
    options.custom_flags(
        raw & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL),
    );

    let file = options.open(&local).map_err(io_kind)?;
    trace!("open {} as fh:{handle}", local.display());

    let mut files = shared.files.lock().unwrap();
    if files.contains_key(&handle.raw()) {
        return Err(FsError::Invalid);
    }
    files.insert(
        handle.raw(),
        Arc::new(OpenEntry {
            path: path.to_owned(),
            io: Mutex::new(file),
        }),
    );
    Ok(())
}

fn close_local(shared: &WorkerShared, handle: FileHandle) -> Result<(), FsError> {
    let entry = shared
        .files
        .lock()
        .unwrap()
        .remove(&handle.raw())
        .ok_or(FsError::BadDescriptor)?;
    shared.ignore(&entry.path);
    // wait out any in-flight operation on this descriptor
    let guard = entry.io.lock().unwrap();
    drop(guard);
    trace!("closed fh:{handle}");
    Ok(())
}

fn read_reply(shared: &WorkerShared, handle: FileHandle, offset: u64, size: u32) -> ReadResult {
    if size as usize > crate::netio::MAX_MESSAGE_SIZE {
        return ReadResult {
            err: FsError::Invalid.wire_code(),
            data: Vec::new(),
        };
    }
    let Some(entry) = shared.lookup(handle) else {
        return ReadResult {
            err: FsError::BadDescriptor.wire_code(),
            data: Vec::new(),
        };
    };
    let file = entry.io.lock().unwrap();
    let mut data = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < data.len() {
        match file.read_at(&mut data[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) => {
                return ReadResult {
                    err: io_kind(err).wire_code(),
                    data: Vec::new(),
                }
            }
        }
    }
    data.truncate(filled);
    ReadResult { err: 0, data }
}

fn write_reply(shared: &WorkerShared, handle: FileHandle, offset: u64, data: &[u8]) -> WriteResult {
    let Some(entry) = shared.lookup(handle) else {
        return WriteResult {
            err: FsError::BadDescriptor.wire_code(),
            written: 0,
        };
    };
    shared.ignore(&entry.path);
    let file = entry.io.lock().unwrap();
    match file.write_all_at(data, offset) {
        Ok(()) => WriteResult {
            err: 0,
            written: data.len() as u32,
        },
        Err(err) => WriteResult {
            err: io_kind(err).wire_code(),
            written: 0,
        },
    }
}

fn preread_reply(shared: &WorkerShared, path: &str, offset: u64, size: u32) -> PrereadResult {
    let fail = |err: FsError| PrereadResult {
        err: err.wire_code(),
        data: Vec::new(),
    };
    if size as usize > crate::netio::MAX_MESSAGE_SIZE {
        return fail(FsError::Invalid);
    }
    let local = match map_path(&shared.root, path) {
        Ok(local) => local,
        Err(err) => return fail(err),
    };
    let file = match File::open(&local) {
        Ok(file) => file,
        Err(err) => return fail(io_kind(err)),
    };
    let mut data = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < data.len() {
        match file.read_at(&mut data[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) => return fail(io_kind(err)),
        }
    }
    data.truncate(filled);
    PrereadResult { err: 0, data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IGNORE_DURATION;

    #[test]
    fn pool_starts_and_drains_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let (link, rx) = ServerLink::bind("127.0.0.1:0", false).unwrap();
        let link = Arc::new(link);
        let ignores = Arc::new(TemporalIgnores::new(IGNORE_DURATION));
        let worker = Worker::new(dir.path().to_path_buf(), Arc::clone(&link), ignores, rx, 4);
        link.start();
        worker.start();
        link.stop();
        worker.join();
        link.join();
    }

    #[test]
    fn exchange_swaps_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();

        exchange_local(&a, &b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"second");
        assert_eq!(fs::read(&b).unwrap(), b"first");

        assert_eq!(
            exchange_local(&a, &dir.path().join("missing")).unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn tree_builder_reports_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), vec![7u8; 42]).unwrap();

        let tree = build_tree(dir.path(), 0);
        assert_eq!(tree.name, ".");
        assert!(tree.attrs.is_dir());
        let sub = tree.children.iter().find(|node| node.name == "sub").unwrap();
        let file = sub.children.iter().find(|node| node.name == "file").unwrap();
        assert_eq!(file.attrs.size, 42);
        assert!(file.attrs.is_file());
    }
}
