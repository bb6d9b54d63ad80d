// CLASSIFICATION: COMMUNITY
// Filename: endtoend.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-08-01

//! Full-stack tests: a real server over TCP loopback, a real client
//! transport, and the caching VFS on top. Only the kernel mount is left
//! out; it is a thin adapter over the same operations contract.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tetherfs::client::cache::Cache;
use tetherfs::client::cached::CachedVfs;
use tetherfs::client::link::ClientLink;
use tetherfs::client::loader::BackgroundLoader;
use tetherfs::client::vfs::{RemoteVfs, Vfs};
use tetherfs::proto::{FsError, OpenFlags, Payload, PayloadKind, Pong, RenameFlags, TimeSpec};
use tetherfs::relay::{Dispatcher, Priority, ReplyTable, Scheduler};
use tetherfs::server::link::ServerLink;
use tetherfs::server::watcher::{TemporalIgnores, Watcher};
use tetherfs::server::worker::Worker;
use tetherfs::{DEFAULT_COMPRESS, IGNORE_DURATION};

struct TestServer {
    dir: TempDir,
    link: Arc<ServerLink>,
    worker: Worker,
    watcher: Option<Watcher>,
    endpoint: String,
}

impl TestServer {
    fn start(with_watcher: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(dir.path()).expect("canonicalize root");

        let (link, inbound) = ServerLink::bind("127.0.0.1:0", DEFAULT_COMPRESS).expect("bind");
        let endpoint = format!("tcp://{}", link.local_addr().expect("local addr"));
        let link = Arc::new(link);
        let ignores = Arc::new(TemporalIgnores::new(IGNORE_DURATION));

        let worker = Worker::new(root.clone(), Arc::clone(&link), Arc::clone(&ignores), inbound, 4);
        link.start();
        worker.start();

        let watcher = with_watcher.then(|| {
            let watcher = Watcher::new(root, Arc::clone(&link), ignores);
            watcher.start();
            watcher
        });

        Self {
            dir,
            link,
            worker,
            watcher,
            endpoint,
        }
    }

    fn root(&self) -> PathBuf {
        fs::canonicalize(self.dir.path()).expect("canonicalize root")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.join();
        }
        self.link.stop();
        self.worker.join();
        self.link.join();
    }
}

struct TestClient {
    scheduler: Arc<Scheduler>,
    replies: Arc<ReplyTable>,
    loader: Arc<BackgroundLoader>,
    vfs: CachedVfs<RemoteVfs>,
    link: ClientLink,
}

impl TestClient {
    fn connect(endpoint: &str, preload: Vec<String>) -> Self {
        let scheduler = Arc::new(Scheduler::seeded());
        let replies = Arc::new(ReplyTable::new());
        let cache = Arc::new(Cache::new());

        let remote = RemoteVfs::new(Arc::clone(&scheduler), Arc::clone(&replies));
        let vfs = CachedVfs::new(remote, Arc::clone(&cache));

        let loader = Arc::new(BackgroundLoader::new(
            Arc::clone(&scheduler),
            Arc::clone(&replies),
            Arc::clone(&cache),
            preload,
        ));

        let mut dispatcher = Dispatcher::new();
        {
            let loader = Arc::clone(&loader);
            dispatcher.subscribe(PayloadKind::NotifyChanged, move |_id, _payload| {
                loader.invalidate();
            });
        }

        let link = ClientLink::new(
            endpoint,
            Arc::clone(&scheduler),
            Arc::clone(&replies),
            Arc::new(dispatcher),
            DEFAULT_COMPRESS,
        );
        link.start();
        loader.start();

        let client = Self {
            scheduler,
            replies,
            loader,
            vfs,
            link,
        };
        client.wait_ready();
        client
    }

    /// Ping until the link is actually up; frames sent before the
    /// connection exists are dropped by design.
    fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let queue = self.scheduler.open_queue(Priority::HIGH);
        while Instant::now() < deadline {
            let mid = queue.push(Payload::Ping);
            let pong: Option<Pong> = self.replies.wait(mid, Duration::from_millis(250));
            if pong.is_some() {
                return;
            }
        }
        panic!("server never answered a ping");
    }

    fn wait_for_path(&self, path: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.vfs.getattr(Path::new(path)).is_ok() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        false
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.loader.stop();
        self.loader.join();
        self.link.stop();
        self.link.join();
    }
}

fn rw_create() -> OpenFlags {
    OpenFlags::from_raw((libc::O_RDWR | libc::O_CREAT) as u32)
}

#[test]
fn create_write_read_back() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    let handle = client
        .vfs
        .create(Path::new("/greeting"), rw_create(), 0o644)
        .expect("create");
    let written = client
        .vfs
        .write(handle, b"hello over the wire", 0)
        .expect("write");
    assert_eq!(written, 19);
    client.vfs.close(handle).expect("close");

    // the write really reached the served directory
    assert_eq!(
        fs::read(server.root().join("greeting")).expect("server file"),
        b"hello over the wire"
    );

    // and the mirror answers stat without further help
    let attrs = client.vfs.getattr(Path::new("/greeting")).expect("getattr");
    assert_eq!(attrs.size, 19);

    // a fresh read-only open serves the same bytes
    let reader = client
        .vfs
        .open(
            Path::new("/greeting"),
            OpenFlags::from_raw(libc::O_RDONLY as u32),
        )
        .expect("open");
    let mut buf = vec![0u8; 19];
    let count = client.vfs.read(reader, &mut buf, 0).expect("read");
    assert_eq!(count, 19);
    assert_eq!(&buf, b"hello over the wire");
    client.vfs.close(reader).expect("close reader");
}

#[test]
fn mkdir_and_readdir_from_mirror() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    client.vfs.mkdir(Path::new("/docs"), 0o755).expect("mkdir");
    let handle = client
        .vfs
        .create(Path::new("/docs/a.txt"), rw_create(), 0o644)
        .expect("create");
    client.vfs.close(handle).expect("close");

    assert!(server.root().join("docs/a.txt").is_file());

    let mut names = Vec::new();
    client
        .vfs
        .readdir(Path::new("/docs"), &mut |name, _attrs| {
            names.push(name.to_owned());
        })
        .expect("readdir");
    assert_eq!(names, ["a.txt"]);
}

#[test]
fn loader_populates_mirror_from_server_state() {
    let server = TestServer::start(false);
    fs::create_dir(server.root().join("seeded")).expect("seed dir");
    fs::write(server.root().join("seeded/data"), vec![9u8; 42]).expect("seed file");

    let client = TestClient::connect(&server.endpoint, vec!["/seeded".to_owned()]);
    client.loader.invalidate();
    assert!(
        client.wait_for_path("/seeded/data", Duration::from_secs(10)),
        "loader never mirrored the seeded file"
    );
    let attrs = client.vfs.getattr(Path::new("/seeded/data")).expect("stat");
    assert_eq!(attrs.size, 42);

    // preloaded content serves reads through a lazy handle
    let handle = client
        .vfs
        .open(
            Path::new("/seeded/data"),
            OpenFlags::from_raw(libc::O_RDONLY as u32),
        )
        .expect("open");
    let mut buf = vec![0u8; 42];
    let count = client.vfs.read(handle, &mut buf, 0).expect("read");
    assert_eq!(count, 42);
    assert_eq!(buf, vec![9u8; 42]);
}

#[test]
fn rename_variants() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    for (name, content) in [("x", "100 bytes"), ("y", "kilobyte")] {
        let handle = client
            .vfs
            .create(&Path::new("/").join(name), rw_create(), 0o644)
            .expect("create");
        client
            .vfs
            .write(handle, content.as_bytes(), 0)
            .expect("write");
        client.vfs.close(handle).expect("close");
    }

    // no-replace refuses an occupied target
    assert_eq!(
        client
            .vfs
            .rename(Path::new("/x"), Path::new("/y"), RenameFlags::NO_REPLACE)
            .unwrap_err(),
        FsError::Exists
    );

    // exchange swaps contents on the server
    client
        .vfs
        .rename(Path::new("/x"), Path::new("/y"), RenameFlags::EXCHANGE)
        .expect("exchange");
    assert_eq!(fs::read(server.root().join("x")).unwrap(), b"kilobyte");
    assert_eq!(fs::read(server.root().join("y")).unwrap(), b"100 bytes");

    // ancestor exchanges are refused locally
    assert_eq!(
        client
            .vfs
            .rename(Path::new("/"), Path::new("/x"), RenameFlags::EXCHANGE)
            .unwrap_err(),
        FsError::Invalid
    );

    // plain rename moves
    client
        .vfs
        .rename(Path::new("/x"), Path::new("/z"), RenameFlags::from_raw(0))
        .expect("rename");
    assert!(!server.root().join("x").exists());
    assert!(server.root().join("z").exists());
    let attrs = client.vfs.getattr(Path::new("/z")).expect("stat renamed");
    assert_eq!(attrs.size, 8);
}

#[test]
fn unlink_removes_everywhere() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    let handle = client
        .vfs
        .create(Path::new("/doomed"), rw_create(), 0o644)
        .expect("create");
    client.vfs.write(handle, b"bytes", 0).expect("write");
    client.vfs.close(handle).expect("close");

    client.vfs.unlink(Path::new("/doomed")).expect("unlink");
    assert!(!server.root().join("doomed").exists());
    assert_eq!(
        client.vfs.getattr(Path::new("/doomed")).unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn utimens_reflects_server_clock_policy() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    let handle = client
        .vfs
        .create(Path::new("/stamped"), rw_create(), 0o644)
        .expect("create");
    client.vfs.close(handle).expect("close");

    let mtime = TimeSpec {
        sec: 1_500_000_000,
        nsec: 0,
    };
    client
        .vfs
        .utimens(Path::new("/stamped"), None, Some(mtime))
        .expect("utimens");

    let attrs = client.vfs.getattr(Path::new("/stamped")).expect("stat");
    assert_eq!(attrs.mtime.sec, 1_500_000_000);

    let meta = fs::metadata(server.root().join("stamped")).expect("server stat");
    use std::os::unix::fs::MetadataExt;
    assert_eq!(meta.mtime(), 1_500_000_000);
}

#[test]
fn truncate_and_chmod_round_trip() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    let handle = client
        .vfs
        .create(Path::new("/sized"), rw_create(), 0o644)
        .expect("create");
    client.vfs.write(handle, &[1u8; 100], 0).expect("write");
    client.vfs.close(handle).expect("close");

    client.vfs.truncate(Path::new("/sized"), 10).expect("truncate");
    assert_eq!(fs::metadata(server.root().join("sized")).unwrap().len(), 10);
    assert_eq!(client.vfs.getattr(Path::new("/sized")).unwrap().size, 10);

    client.vfs.chmod(Path::new("/sized"), 0o600).expect("chmod");
    use std::os::unix::fs::MetadataExt;
    assert_eq!(
        fs::metadata(server.root().join("sized")).unwrap().mode() & 0o777,
        0o600
    );
}

#[test]
fn symlink_and_readlink() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    client
        .vfs
        .symlink(Path::new("/somewhere/else"), Path::new("/pointer"))
        .expect("symlink");
    let target = client.vfs.readlink(Path::new("/pointer")).expect("readlink");
    assert_eq!(target, PathBuf::from("/somewhere/else"));

    let attrs = client.vfs.getattr(Path::new("/pointer")).expect("stat");
    assert!(attrs.is_symlink());
}

#[test]
fn large_io_crosses_fragment_boundaries() {
    let server = TestServer::start(false);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    // three fragments plus a tail
    let payload: Vec<u8> = (0..(96 * 1024 + 1000)).map(|v| (v % 251) as u8).collect();
    let handle = client
        .vfs
        .create(Path::new("/big"), rw_create(), 0o644)
        .expect("create");
    let written = client.vfs.write(handle, &payload, 0).expect("write");
    assert_eq!(written, payload.len());
    client.vfs.close(handle).expect("close");

    assert_eq!(fs::read(server.root().join("big")).unwrap(), payload);

    let reader = client
        .vfs
        .open(Path::new("/big"), OpenFlags::from_raw(libc::O_RDONLY as u32))
        .expect("open");
    let mut buf = vec![0u8; payload.len()];
    let count = client.vfs.read(reader, &mut buf, 0).expect("read");
    assert_eq!(count, payload.len());
    assert_eq!(buf, payload);

    // a fresh client has no cached blocks, so this read really
    // travels the wire in fragments; the link serves one client at a
    // time, so disconnect the first before the second dials in
    drop(client);
    let other = TestClient::connect(&server.endpoint, Vec::new());
    other.loader.invalidate();
    assert!(other.wait_for_path("/big", Duration::from_secs(10)));
    let remote_reader = other
        .vfs
        .open(Path::new("/big"), OpenFlags::from_raw(libc::O_RDONLY as u32))
        .expect("open");
    let mut remote_buf = vec![0u8; payload.len()];
    let count = other
        .vfs
        .read(remote_reader, &mut remote_buf, 0)
        .expect("remote read");
    assert_eq!(count, payload.len());
    assert_eq!(remote_buf, payload);
}

#[test]
fn watcher_notifies_about_external_edits() {
    let server = TestServer::start(true);
    let client = TestClient::connect(&server.endpoint, Vec::new());

    // give the recursive subscription a moment to arm
    std::thread::sleep(Duration::from_millis(500));

    fs::write(server.root().join("external"), b"edited behind the client").expect("edit");

    assert!(
        client.wait_for_path("/external", Duration::from_secs(20)),
        "external edit never reached the mirror"
    );
    let attrs = client.vfs.getattr(Path::new("/external")).expect("stat");
    assert_eq!(attrs.size, 24);
}
