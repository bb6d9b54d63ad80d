// CLASSIFICATION: COMMUNITY
// Filename: paths.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-08

//! Served-root path mapping and the breadth-first tree fingerprint the
//! watcher compares while waiting for local edits to settle.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::proto::FsError;

/// Resolve a wire path against the served root. Parent components are
/// folded lexically; any attempt to climb above the root is refused.
pub fn map_path(root: &Path, wire: &str) -> Result<PathBuf, FsError> {
    if !wire.starts_with('/') {
        return Err(FsError::Invalid);
    }
    let mut rel = PathBuf::new();
    for component in Path::new(wire).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => rel.push(name),
            Component::ParentDir => {
                if !rel.pop() {
                    return Err(FsError::AccessDenied);
                }
            }
            Component::Prefix(_) => return Err(FsError::Invalid),
        }
    }
    Ok(root.join(rel))
}

/// Convert a filesystem path under the root back to its wire form.
#[must_use]
pub fn wire_path(root: &Path, local: &Path) -> Option<PathBuf> {
    let rel = local.strip_prefix(root).ok()?;
    Some(Path::new("/").join(rel))
}

/// Entry kind recorded in a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Other,
}

impl From<fs::FileType> for EntryKind {
    fn from(kind: fs::FileType) -> Self {
        if kind.is_dir() {
            Self::Directory
        } else if kind.is_symlink() {
            Self::Symlink
        } else if kind.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// One fingerprint line: a reachable path, its kind and how many
/// children it lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintItem {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub children: u32,
}

/// Breadth-first fingerprint of everything reachable under `root`.
/// Symlinks are recorded but not followed. Children are sorted so two
/// fingerprints of the same state compare equal.
pub fn fingerprint(root: &Path) -> io::Result<Vec<FingerprintItem>> {
    let mut list = vec![FingerprintItem {
        path: root.to_path_buf(),
        kind: EntryKind::from(fs::symlink_metadata(root)?.file_type()),
        children: 0,
    }];

    let mut index = 0;
    while index < list.len() {
        if list[index].kind == EntryKind::Directory {
            let mut children = Vec::new();
            for entry in fs::read_dir(&list[index].path)? {
                let entry = entry?;
                children.push(FingerprintItem {
                    path: entry.path(),
                    kind: EntryKind::from(entry.file_type()?),
                    children: 0,
                });
            }
            children.sort_by(|a, b| a.path.cmp(&b.path));
            list[index].children = children.len() as u32;
            list.extend(children);
        }
        index += 1;
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_path_stays_inside_the_root() {
        let root = Path::new("/srv/data");
        assert_eq!(map_path(root, "/").unwrap(), PathBuf::from("/srv/data"));
        assert_eq!(
            map_path(root, "/a/b").unwrap(),
            PathBuf::from("/srv/data/a/b")
        );
        assert_eq!(
            map_path(root, "/a/../b").unwrap(),
            PathBuf::from("/srv/data/b")
        );
        assert_eq!(
            map_path(root, "/../escape").unwrap_err(),
            FsError::AccessDenied
        );
        assert_eq!(
            map_path(root, "/a/../../escape").unwrap_err(),
            FsError::AccessDenied
        );
        assert_eq!(map_path(root, "relative").unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn wire_path_inverts_mapping() {
        let root = Path::new("/srv/data");
        assert_eq!(
            wire_path(root, Path::new("/srv/data/a/b")).unwrap(),
            PathBuf::from("/a/b")
        );
        assert_eq!(
            wire_path(root, Path::new("/srv/data")).unwrap(),
            PathBuf::from("/")
        );
        assert!(wire_path(root, Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_sees_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"hello").unwrap();

        let first = fingerprint(dir.path()).unwrap();
        let second = fingerprint(dir.path()).unwrap();
        assert_eq!(first, second);

        fs::write(dir.path().join("sub/other"), b"x").unwrap();
        let third = fingerprint(dir.path()).unwrap();
        assert_ne!(first, third);
    }
}
