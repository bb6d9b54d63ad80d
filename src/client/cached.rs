// CLASSIFICATION: COMMUNITY
// Filename: cached.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Write-through caching layer above the remote operations. Attribute
//! and directory reads come from the mirrored tree, content reads from
//! the block cache when they can; every mutation reaches the server
//! before the mirror is touched, so the cache never shows state the
//! server has not acknowledged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::client::cache::Cache;
use crate::client::vfs::{DirSink, Vfs};
use crate::proto::{Attributes, FileHandle, FsError, OpenFlags, RenameFlags, TimeSpec};
use crate::relay::IdGen;

struct OpenFile {
    path: PathBuf,
    flags: OpenFlags,
    remote: Option<FileHandle>,
}

/// Caching layer over a remote operations implementor. Open files are
/// tracked locally; read-only opens defer their remote descriptor
/// until a cache miss actually needs one.
pub struct CachedVfs<V: Vfs> {
    inner: V,
    cache: Arc<Cache>,
    handle_ids: IdGen,
    open_files: Mutex<HashMap<u64, OpenFile>>,
}

impl<V: Vfs> CachedVfs<V> {
    /// Stack the cache above `inner`.
    #[must_use]
    pub fn new(inner: V, cache: Arc<Cache>) -> Self {
        Self {
            inner,
            cache,
            handle_ids: IdGen::seeded(),
            open_files: Mutex::new(HashMap::new()),
        }
    }

    /// Record `attrs` at `path`, creating the node when the mirror does
    /// not have it yet.
    fn store_attrs(&self, path: &Path, attrs: Attributes) {
        let mut state = self.cache.lock();
        match state.tree.get_node_mut(path) {
            Ok(node) => node.attrs = attrs,
            Err(_) => match state.tree.make_node(path) {
                Ok(node) => node.attrs = attrs,
                Err(err) => debug!("mirror skipped for {}: {err}", path.display()),
            },
        }
    }

    /// Creation and removal also touch the parent's times; re-fetch
    /// them so the mirror stays coherent.
    fn refresh_parent(&self, path: &Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        match self.inner.getattr(parent) {
            Ok(attrs) => {
                let mut state = self.cache.lock();
                if let Ok(node) = state.tree.get_node_mut(parent) {
                    node.attrs = attrs;
                }
            }
            Err(err) => debug!("parent refresh failed for {}: {err}", parent.display()),
        }
    }

    fn lookup_open(&self, handle: FileHandle) -> Result<(PathBuf, OpenFlags, Option<FileHandle>), FsError> {
        let files = self.open_files.lock().unwrap();
        let entry = files.get(&handle.raw()).ok_or(FsError::BadDescriptor)?;
        Ok((entry.path.clone(), entry.flags, entry.remote))
    }

    fn register_open(&self, path: &Path, flags: OpenFlags, remote: Option<FileHandle>) -> FileHandle {
        let handle = FileHandle::from_raw(self.handle_ids.next());
        self.open_files.lock().unwrap().insert(
            handle.raw(),
            OpenFile {
                path: path.to_path_buf(),
                flags,
                remote,
            },
        );
        handle
    }
}

impl<V: Vfs> Vfs for CachedVfs<V> {
    fn getattr(&self, path: &Path) -> Result<Attributes, FsError> {
        let state = self.cache.lock();
        state.tree.get_node(path).map(|node| node.attrs)
    }

    fn readdir(&self, path: &Path, sink: DirSink<'_>) -> Result<(), FsError> {
        let state = self.cache.lock();
        let node = state.tree.get_node(path)?;
        for (name, child) in &node.children {
            sink(name, Some(&child.attrs));
        }
        Ok(())
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, FsError> {
        self.inner.readlink(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.inner.mkdir(path, mode)?;
        let attrs = self.inner.getattr(path)?;
        self.store_attrs(path, attrs);
        self.refresh_parent(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        if path == Path::new("/") {
            return Err(FsError::AccessDenied);
        }
        self.inner.rmdir(path)?;
        {
            let mut state = self.cache.lock();
            if let Err(err) = state.tree.remove_single(path) {
                debug!("mirror removal failed for {}: {err}", path.display());
            }
        }
        self.refresh_parent(path);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<(), FsError> {
        if path == Path::new("/") {
            return Err(FsError::AccessDenied);
        }
        self.inner.unlink(path)?;
        {
            let mut state = self.cache.lock();
            if let Err(err) = state.tree.remove_single(path) {
                debug!("mirror removal failed for {}: {err}", path.display());
            }
            state.content.delete_file(path);
        }
        self.refresh_parent(path);
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError> {
        self.inner.symlink(target, link)?;
        let attrs = self.inner.getattr(link)?;
        self.store_attrs(link, attrs);
        self.refresh_parent(link);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path, flags: RenameFlags) -> Result<(), FsError> {
        let root = Path::new("/");
        if flags.is_exchange() {
            // refuse ancestor pairs locally, no round trip needed
            if from.starts_with(to) || to.starts_with(from) {
                return Err(FsError::Invalid);
            }
        } else if from == root || to == root {
            return Err(FsError::Exists);
        }
        self.inner.rename(from, to, flags)?;
        {
            let mut state = self.cache.lock();
            let applied = if flags.is_exchange() {
                state.tree.exchange(from, to)
            } else {
                state.tree.rename(from, to)
            };
            if let Err(err) = applied {
                debug!(
                    "mirror rename failed for {} -> {}: {err}",
                    from.display(),
                    to.display()
                );
            }
            // content is keyed by path; dropping both sides is the
            // conservative way to keep reads honest
            state.content.delete_file(from);
            state.content.delete_file(to);
        }
        self.refresh_parent(from);
        self.refresh_parent(to);
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.inner.chmod(path, mode)?;
        let mut state = self.cache.lock();
        if let Ok(node) = state.tree.get_node_mut(path) {
            node.attrs.mode = (node.attrs.mode & libc::S_IFMT) | (mode & 0o7777);
        }
        Ok(())
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> Result<(), FsError> {
        if atime.is_none() && mtime.is_none() {
            return Ok(());
        }
        self.inner.utimens(path, atime, mtime)?;
        // the server's clock decides; fetch what it actually stored
        let attrs = self.inner.getattr(path)?;
        self.store_attrs(path, attrs);
        Ok(())
    }

    fn truncate(&self, path: &Path, length: u64) -> Result<(), FsError> {
        self.inner.truncate(path, length)?;
        let mut state = self.cache.lock();
        if let Ok(node) = state.tree.get_node_mut(path) {
            node.attrs.size = length;
        }
        state.content.delete_file(path);
        Ok(())
    }

    fn create(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<FileHandle, FsError> {
        let remote = self.inner.create(path, flags, mode)?;
        let attrs = self.inner.getattr(path)?;
        self.store_attrs(path, attrs);
        let handle = self.register_open(path, flags, Some(remote));
        self.refresh_parent(path);
        trace!("create fh:{handle} '{}'", path.display());
        Ok(handle)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let remote = if flags.is_write_capable() {
            Some(self.inner.open(path, flags)?)
        } else {
            // lazy: a read that the cache satisfies never needs the
            // server to know about this open
            None
        };
        let handle = self.register_open(path, flags, remote);
        trace!("open fh:{handle} '{}'", path.display());
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) -> Result<(), FsError> {
        let (_, _, remote) = self.lookup_open(handle)?;
        if let Some(remote) = remote {
            self.inner.close(remote)?;
        }
        self.open_files.lock().unwrap().remove(&handle.raw());
        trace!("close fh:{handle}");
        Ok(())
    }

    fn read(&self, handle: FileHandle, out: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let (path, flags, remote) = self.lookup_open(handle)?;
        {
            let state = self.cache.lock();
            let mut copied = 0usize;
            let hit = state.content.read(&path, offset, out.len(), |bytes| {
                out.copy_from_slice(bytes);
                copied = bytes.len();
            });
            if hit {
                trace!("read fh:{handle} served {copied}B from cache");
                return Ok(copied);
            }
        }

        let remote = match remote {
            Some(remote) => remote,
            None => {
                let opened = self.inner.open(&path, flags)?;
                let mut files = self.open_files.lock().unwrap();
                match files.get_mut(&handle.raw()) {
                    Some(entry) => entry.remote = Some(opened),
                    // closed while we were opening; do not leak the
                    // server-side descriptor
                    None => {
                        drop(files);
                        let _ = self.inner.close(opened);
                        return Err(FsError::BadDescriptor);
                    }
                }
                opened
            }
        };

        let count = self.inner.read(remote, out, offset)?;
        let mut state = self.cache.lock();
        state.content.write(&path, offset, out[..count].to_vec());
        Ok(count)
    }

    fn write(&self, handle: FileHandle, data: &[u8], offset: u64) -> Result<usize, FsError> {
        let (path, _, remote) = self.lookup_open(handle)?;
        let remote = remote.ok_or(FsError::BadDescriptor)?;

        let count = self.inner.write(remote, data, offset)?;
        match self.inner.getattr(&path) {
            Ok(attrs) => self.store_attrs(&path, attrs),
            Err(err) => debug!("attr refresh failed for {}: {err}", path.display()),
        }
        let mut state = self.cache.lock();
        state.content.write(&path, offset, data[..count].to_vec());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inner stand-in that counts round trips and serves a tiny
    /// in-memory file.
    #[derive(Default)]
    struct CountingVfs {
        calls: AtomicUsize,
        file: Mutex<Vec<u8>>,
    }

    impl CountingVfs {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn bump(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Vfs for CountingVfs {
        fn getattr(&self, _path: &Path) -> Result<Attributes, FsError> {
            self.bump();
            Ok(Attributes {
                mode: libc::S_IFREG | 0o644,
                nlink: 1,
                size: self.file.lock().unwrap().len() as u64,
                ..Attributes::default()
            })
        }

        fn readdir(&self, _path: &Path, _sink: DirSink<'_>) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn readlink(&self, _path: &Path) -> Result<PathBuf, FsError> {
            self.bump();
            Ok(PathBuf::from("/target"))
        }

        fn mkdir(&self, _path: &Path, _mode: u32) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn rmdir(&self, _path: &Path) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn unlink(&self, _path: &Path) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn symlink(&self, _target: &Path, _link: &Path) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn rename(&self, _from: &Path, _to: &Path, _flags: RenameFlags) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn chmod(&self, _path: &Path, _mode: u32) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn utimens(
            &self,
            _path: &Path,
            _atime: Option<TimeSpec>,
            _mtime: Option<TimeSpec>,
        ) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn truncate(&self, _path: &Path, _length: u64) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn create(&self, _path: &Path, _flags: OpenFlags, _mode: u32) -> Result<FileHandle, FsError> {
            self.bump();
            Ok(FileHandle::from_raw(1))
        }

        fn open(&self, _path: &Path, _flags: OpenFlags) -> Result<FileHandle, FsError> {
            self.bump();
            Ok(FileHandle::from_raw(2))
        }

        fn close(&self, _handle: FileHandle) -> Result<(), FsError> {
            self.bump();
            Ok(())
        }

        fn read(&self, _handle: FileHandle, out: &mut [u8], offset: u64) -> Result<usize, FsError> {
            self.bump();
            let file = self.file.lock().unwrap();
            let from = (offset as usize).min(file.len());
            let count = out.len().min(file.len() - from);
            out[..count].copy_from_slice(&file[from..from + count]);
            Ok(count)
        }

        fn write(&self, _handle: FileHandle, data: &[u8], offset: u64) -> Result<usize, FsError> {
            self.bump();
            let mut file = self.file.lock().unwrap();
            let end = offset as usize + data.len();
            if file.len() < end {
                file.resize(end, 0);
            }
            file[offset as usize..end].copy_from_slice(data);
            Ok(data.len())
        }
    }

    fn stack() -> (Arc<Cache>, CachedVfs<CountingVfs>) {
        let cache = Arc::new(Cache::new());
        let vfs = CachedVfs::new(CountingVfs::default(), Arc::clone(&cache));
        (cache, vfs)
    }

    fn seed_file(cache: &Cache, path: &str, size: u64) {
        let mut state = cache.lock();
        let mut walked = PathBuf::from("/");
        for name in Path::new(path).components().skip(1) {
            walked.push(name);
            let _ = state.tree.make_node(&walked);
        }
        state.tree.get_node_mut(Path::new(path)).unwrap().attrs = Attributes {
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            size,
            ..Attributes::default()
        };
    }

    #[test]
    fn getattr_hits_generate_no_round_trip() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/a/b", 42);

        let attrs = vfs.getattr(Path::new("/a/b")).unwrap();
        assert_eq!(attrs.size, 42);
        assert_eq!(vfs.inner.calls(), 0);

        assert_eq!(
            vfs.getattr(Path::new("/a/missing")).unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(vfs.inner.calls(), 0);
    }

    #[test]
    fn readdir_serves_children_from_the_tree() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/dir/one", 1);
        seed_file(&cache, "/dir/two", 2);

        let mut names = Vec::new();
        vfs.readdir(Path::new("/dir"), &mut |name, attrs| {
            assert!(attrs.is_some());
            names.push(name.to_owned());
        })
        .unwrap();
        names.sort();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(vfs.inner.calls(), 0);
    }

    #[test]
    fn read_only_open_is_lazy_and_cached_reread_is_free() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/a/b", 16);

        let flags = OpenFlags::from_raw(libc::O_RDONLY as u32);
        let handle = vfs.open(Path::new("/a/b"), flags).unwrap();
        assert_eq!(vfs.inner.calls(), 0, "lazy open must not call out");

        *vfs.inner.file.lock().unwrap() = (0u8..16).collect();
        let mut buf = [0u8; 16];
        let count = vfs.read(handle, &mut buf, 0).unwrap();
        assert_eq!(count, 16);
        let after_first = vfs.inner.calls();
        assert!(after_first >= 2, "miss needs open + read");

        let mut again = [0u8; 16];
        let count = vfs.read(handle, &mut again, 0).unwrap();
        assert_eq!(count, 16);
        assert_eq!(again, buf);
        assert_eq!(vfs.inner.calls(), after_first, "cached re-read is free");
    }

    #[test]
    fn write_requires_writable_handle() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/a/b", 4);

        let handle = vfs
            .open(Path::new("/a/b"), OpenFlags::from_raw(libc::O_RDONLY as u32))
            .unwrap();
        assert_eq!(
            vfs.write(handle, b"data", 0).unwrap_err(),
            FsError::BadDescriptor
        );
    }

    #[test]
    fn write_through_updates_size_and_content() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/f", 0);

        let handle = vfs
            .open(Path::new("/f"), OpenFlags::from_raw(libc::O_RDWR as u32))
            .unwrap();
        let count = vfs.write(handle, b"hello", 0).unwrap();
        assert_eq!(count, 5);

        assert_eq!(vfs.getattr(Path::new("/f")).unwrap().size, 5);
        let mut buf = [0u8; 5];
        let calls = vfs.inner.calls();
        assert_eq!(vfs.read(handle, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(vfs.inner.calls(), calls, "written bytes readable from cache");
    }

    #[test]
    fn close_twice_fails_bad_descriptor() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/f", 0);

        let handle = vfs
            .open(Path::new("/f"), OpenFlags::from_raw(libc::O_WRONLY as u32))
            .unwrap();
        vfs.close(handle).unwrap();
        assert_eq!(vfs.close(handle).unwrap_err(), FsError::BadDescriptor);
    }

    #[test]
    fn exchange_updates_cached_sizes() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/x", 100);
        seed_file(&cache, "/y", 1000);

        vfs.rename(Path::new("/x"), Path::new("/y"), RenameFlags::EXCHANGE)
            .unwrap();
        assert_eq!(vfs.getattr(Path::new("/x")).unwrap().size, 1000);
        assert_eq!(vfs.getattr(Path::new("/y")).unwrap().size, 100);
    }

    #[test]
    fn exchange_with_ancestor_fails_locally() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/x", 1);

        let before = vfs.inner.calls();
        assert_eq!(
            vfs.rename(Path::new("/"), Path::new("/x"), RenameFlags::EXCHANGE)
                .unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            vfs.rename(Path::new("/x"), Path::new("/x"), RenameFlags::EXCHANGE)
                .unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(vfs.inner.calls(), before, "no round trip for local refusal");
    }

    #[test]
    fn utimens_skips_round_trip_when_left_alone() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/f", 1);

        vfs.utimens(Path::new("/f"), None, None).unwrap();
        assert_eq!(vfs.inner.calls(), 0);

        vfs.utimens(Path::new("/f"), None, Some(TimeSpec { sec: 5, nsec: 0 }))
            .unwrap();
        assert!(vfs.inner.calls() > 0);
    }

    #[test]
    fn unlink_drops_cached_content() {
        let (cache, vfs) = stack();
        seed_file(&cache, "/f", 4);
        cache.lock().content.write(Path::new("/f"), 0, vec![1; 4]);

        vfs.unlink(Path::new("/f")).unwrap();
        let state = cache.lock();
        assert!(!state.content.read(Path::new("/f"), 0, 4, |_| unreachable!()));
        assert_eq!(
            state.tree.get_node(Path::new("/f")).unwrap_err(),
            FsError::NotFound
        );
    }
}
