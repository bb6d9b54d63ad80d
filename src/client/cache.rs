// CLASSIFICATION: COMMUNITY
// Filename: cache.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-07-26

//! Client-side mirror of the served directory: a path-indexed attribute
//! tree and a per-path list of coalescing content blocks, guarded by a
//! single lock. Callers must release the lock around anything that can
//! block on the network.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::proto::{Attributes, FsError};

/// One mirrored directory entry. Children are keyed by name; the keys
/// are unique per parent and order carries no meaning.
#[derive(Debug)]
pub struct Node {
    /// Entry name without path components; the root is ".".
    pub name: String,
    /// Mirrored attributes.
    pub attrs: Attributes,
    /// Child entries.
    pub children: BTreeMap<String, Node>,
}

impl Node {
    /// Empty node with default attributes.
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            attrs: Attributes::default(),
            children: BTreeMap::new(),
        }
    }
}

/// The mirrored attribute tree. The root is synthetic and survives
/// every reset.
#[derive(Debug)]
pub struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Tree holding only the synthetic root.
    #[must_use]
    pub fn new() -> Self {
        let mut root = Node::new(".".to_owned());
        root.attrs.mode = libc::S_IFDIR | 0o555;
        root.attrs.nlink = 2;
        Self { root }
    }

    /// Drop every child of the root.
    pub fn reset(&mut self) {
        self.root.children.clear();
    }

    /// Borrow the root node.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Mutably borrow the root node.
    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    /// Walk to the node at `path`, failing at the first missing
    /// component.
    pub fn get_node(&self, path: &Path) -> Result<&Node, FsError> {
        let mut node = &self.root;
        for name in path_names(path) {
            node = node.children.get(name?).ok_or(FsError::NotFound)?;
        }
        Ok(node)
    }

    /// Mutable variant of [`Tree::get_node`].
    pub fn get_node_mut(&mut self, path: &Path) -> Result<&mut Node, FsError> {
        let mut node = &mut self.root;
        for name in path_names(path) {
            node = node.children.get_mut(name?).ok_or(FsError::NotFound)?;
        }
        Ok(node)
    }

    /// Insert an empty node at `path`. Fails with `Exists` when the
    /// name is taken, including for the root itself.
    pub fn make_node(&mut self, path: &Path) -> Result<&mut Node, FsError> {
        let (parent, name) = split_path(path).ok_or(FsError::Exists)?;
        let parent = self.get_node_mut(&parent)?;
        if parent.children.contains_key(&name) {
            return Err(FsError::Exists);
        }
        Ok(parent
            .children
            .entry(name.clone())
            .or_insert_with(|| Node::new(name)))
    }

    /// Remove the node at `path` only when it has no children.
    pub fn remove_single(&mut self, path: &Path) -> Result<(), FsError> {
        let (parent, name) = split_path(path).ok_or(FsError::AccessDenied)?;
        let parent = self.get_node_mut(&parent)?;
        let node = parent.children.get(&name).ok_or(FsError::NotFound)?;
        if !node.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        parent.children.remove(&name);
        Ok(())
    }

    /// Move the node at `from` to `to`. Fails with `Exists` when the
    /// target is taken and `NotFound` when the source is missing;
    /// performed atomically under the cache lock.
    pub fn rename(&mut self, from: &Path, to: &Path) -> Result<(), FsError> {
        let (from_parent, from_name) = split_path(from).ok_or(FsError::Exists)?;
        let (to_parent, to_name) = split_path(to).ok_or(FsError::Exists)?;
        if to.starts_with(from) {
            return Err(FsError::Invalid);
        }
        {
            let source = self.get_node(&from_parent)?;
            if !source.children.contains_key(&from_name) {
                return Err(FsError::NotFound);
            }
            let target = self.get_node(&to_parent)?;
            if target.children.contains_key(&to_name) {
                return Err(FsError::Exists);
            }
        }
        let mut node = {
            let parent = self.get_node_mut(&from_parent)?;
            parent.children.remove(&from_name).ok_or(FsError::NotFound)?
        };
        node.name = to_name.clone();
        let parent = self.get_node_mut(&to_parent)?;
        parent.children.insert(to_name, node);
        Ok(())
    }

    /// Swap the attribute records and children of two nodes. Refuses
    /// ancestor/descendant pairs, including equal paths.
    pub fn exchange(&mut self, first: &Path, second: &Path) -> Result<(), FsError> {
        if first.starts_with(second) || second.starts_with(first) {
            return Err(FsError::Invalid);
        }
        self.get_node(first)?;
        self.get_node(second)?;

        let (first_attrs, first_children) = {
            let node = self.get_node_mut(first)?;
            (node.attrs, std::mem::take(&mut node.children))
        };
        let (second_attrs, second_children) = {
            let node = self.get_node_mut(second)?;
            let taken = (node.attrs, std::mem::take(&mut node.children));
            node.attrs = first_attrs;
            node.children = first_children;
            taken
        };
        let node = self.get_node_mut(first)?;
        node.attrs = second_attrs;
        node.children = second_children;
        Ok(())
    }
}

/// One cached byte range of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset of the first byte.
    pub start: u64,
    /// The cached bytes.
    pub data: Vec<u8>,
}

impl Block {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// File-content cache. After every mutation the blocks of a path are
/// pairwise disjoint and non-touching.
#[derive(Debug, Default)]
pub struct Content {
    files: HashMap<PathBuf, Vec<Block>>,
}

impl Content {
    /// Delete all content.
    pub fn reset(&mut self) {
        self.files.clear();
    }

    /// Serve `size` bytes at `start` when a single cached block fully
    /// covers the range; the sink receives exactly that subrange.
    /// Returns false on partial or missing coverage.
    pub fn read(
        &self,
        path: &Path,
        start: u64,
        size: usize,
        sink: impl FnOnce(&[u8]),
    ) -> bool {
        let Some(blocks) = self.files.get(path) else {
            return false;
        };
        let end = start + size as u64;
        for block in blocks {
            if block.start <= start && end <= block.end() {
                let from = (start - block.start) as usize;
                sink(&block.data[from..from + size]);
                return true;
            }
        }
        false
    }

    /// Record bytes at `start`. A write inside an existing block
    /// mutates it in place; anything else replaces the overlapped
    /// ranges and re-coalesces the block list.
    pub fn write(&mut self, path: &Path, start: u64, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let blocks = self.files.entry(path.to_path_buf()).or_default();
        let end = start + data.len() as u64;

        for block in blocks.iter_mut() {
            if block.start <= start && end <= block.end() {
                let from = (start - block.start) as usize;
                block.data[from..from + data.len()].copy_from_slice(&data);
                return;
            }
        }

        // Carve the incoming range out of older blocks so stale bytes
        // never survive a flatten.
        let mut kept = Vec::with_capacity(blocks.len() + 1);
        for block in blocks.drain(..) {
            if block.end() <= start || block.start >= end {
                kept.push(block);
                continue;
            }
            if block.start < start {
                let head = (start - block.start) as usize;
                kept.push(Block {
                    start: block.start,
                    data: block.data[..head].to_vec(),
                });
            }
            if block.end() > end {
                let tail = (end - block.start) as usize;
                kept.push(Block {
                    start: end,
                    data: block.data[tail..].to_vec(),
                });
            }
        }
        kept.push(Block { start, data });
        *blocks = kept;
        flatten(blocks);
    }

    /// Forget every block of `path`.
    pub fn delete_file(&mut self, path: &Path) {
        self.files.remove(path);
    }

    #[cfg(test)]
    fn blocks(&self, path: &Path) -> &[Block] {
        self.files.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn flatten(blocks: &mut Vec<Block>) {
    blocks.sort_by_key(|block| block.start);
    let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks.drain(..) {
        match merged.last_mut() {
            Some(last) if last.end() >= block.start => {
                let at = (block.start - last.start) as usize;
                let needed = at + block.data.len();
                if last.data.len() < needed {
                    last.data.resize(needed, 0);
                }
                last.data[at..needed].copy_from_slice(&block.data);
            }
            _ => merged.push(block),
        }
    }
    *blocks = merged;
}

/// Tree and content under one lock.
#[derive(Debug, Default)]
pub struct CacheState {
    /// The mirrored attribute tree.
    pub tree: Tree,
    /// The content block store.
    pub content: Content,
}

impl CacheState {
    /// Drop the tree children and all content.
    pub fn reset(&mut self) {
        self.tree.reset();
        self.content.reset();
    }
}

/// Shared handle over the cache lock.
#[derive(Debug, Default)]
pub struct Cache {
    state: Mutex<CacheState>,
}

impl Cache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the cache lock for the duration of one operation.
    pub fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap()
    }
}

fn path_names(path: &Path) -> impl Iterator<Item = Result<&str, FsError>> {
    path.components().filter_map(|component| match component {
        std::path::Component::Normal(name) => {
            Some(name.to_str().ok_or(FsError::Invalid))
        }
        _ => None,
    })
}

fn split_path(path: &Path) -> Option<(PathBuf, String)> {
    let name = path.file_name()?.to_str()?.to_owned();
    let parent = path.parent().unwrap_or(Path::new("/")).to_path_buf();
    Some((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(size: u64) -> Attributes {
        Attributes {
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            size,
            ..Attributes::default()
        }
    }

    #[test]
    fn get_node_walks_from_root() {
        let mut tree = Tree::new();
        assert!(tree.get_node(Path::new("/")).is_ok());
        assert_eq!(
            tree.get_node(Path::new("/nonexistent")).unwrap_err(),
            FsError::NotFound
        );

        tree.make_node(Path::new("/some")).unwrap();
        tree.make_node(Path::new("/some/sub")).unwrap();
        assert!(tree.get_node(Path::new("/some/sub")).is_ok());
        assert_eq!(
            tree.get_node(Path::new("/some/sub2")).unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn make_node_twice_fails_and_leaves_tree_unchanged() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/dup")).unwrap().attrs = sized(1);
        assert_eq!(
            tree.make_node(Path::new("/dup")).unwrap_err(),
            FsError::Exists
        );
        assert_eq!(tree.get_node(Path::new("/dup")).unwrap().attrs, sized(1));
        assert_eq!(
            tree.make_node(Path::new("/")).unwrap_err(),
            FsError::Exists
        );
    }

    #[test]
    fn remove_single_guards() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/dir")).unwrap();
        tree.make_node(Path::new("/dir/leaf")).unwrap();

        assert_eq!(
            tree.remove_single(Path::new("/")).unwrap_err(),
            FsError::AccessDenied
        );
        assert_eq!(
            tree.remove_single(Path::new("/missing")).unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(
            tree.remove_single(Path::new("/dir")).unwrap_err(),
            FsError::NotEmpty
        );
        tree.remove_single(Path::new("/dir/leaf")).unwrap();
        tree.remove_single(Path::new("/dir")).unwrap();
    }

    #[test]
    fn rename_moves_subtrees() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/a")).unwrap();
        tree.make_node(Path::new("/a/inner")).unwrap();
        tree.make_node(Path::new("/b")).unwrap();

        assert_eq!(
            tree.rename(Path::new("/a"), Path::new("/b")).unwrap_err(),
            FsError::Exists
        );
        assert_eq!(
            tree.rename(Path::new("/missing"), Path::new("/c"))
                .unwrap_err(),
            FsError::NotFound
        );

        tree.rename(Path::new("/a"), Path::new("/c")).unwrap();
        assert!(tree.get_node(Path::new("/c/inner")).is_ok());
        assert_eq!(
            tree.get_node(Path::new("/a")).unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(tree.get_node(Path::new("/c")).unwrap().name, "c");
    }

    #[test]
    fn exchange_swaps_attrs_and_children() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/x")).unwrap().attrs = sized(100);
        tree.make_node(Path::new("/y")).unwrap().attrs = sized(1000);
        tree.make_node(Path::new("/y/deep")).unwrap();

        tree.exchange(Path::new("/x"), Path::new("/y")).unwrap();
        assert_eq!(tree.get_node(Path::new("/x")).unwrap().attrs.size, 1000);
        assert_eq!(tree.get_node(Path::new("/y")).unwrap().attrs.size, 100);
        assert!(tree.get_node(Path::new("/x/deep")).is_ok());
    }

    #[test]
    fn exchange_rejects_ancestor_pairs() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/x")).unwrap();
        tree.make_node(Path::new("/x/in")).unwrap();

        assert_eq!(
            tree.exchange(Path::new("/"), Path::new("/x")).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            tree.exchange(Path::new("/x"), Path::new("/x")).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            tree.exchange(Path::new("/x"), Path::new("/x/in"))
                .unwrap_err(),
            FsError::Invalid
        );
    }

    #[test]
    fn parent_links_stay_consistent() {
        let mut tree = Tree::new();
        tree.make_node(Path::new("/a")).unwrap();
        tree.make_node(Path::new("/a/b")).unwrap();
        tree.rename(Path::new("/a/b"), Path::new("/b")).unwrap();

        fn check(node: &Node) {
            for (key, child) in &node.children {
                assert_eq!(key, &child.name);
                check(child);
            }
        }
        check(tree.root());
    }

    #[test]
    fn content_read_requires_full_single_block_coverage() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 10, vec![1; 10]);

        let mut seen = Vec::new();
        assert!(content.read(path, 12, 4, |bytes| seen = bytes.to_vec()));
        assert_eq!(seen, vec![1; 4]);

        assert!(!content.read(path, 8, 4, |_| unreachable!()));
        assert!(!content.read(path, 18, 4, |_| unreachable!()));
        assert!(!content.read(Path::new("/other"), 10, 2, |_| unreachable!()));
    }

    #[test]
    fn touching_blocks_are_merged() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 0, vec![1; 4]);
        content.write(path, 4, vec![2; 4]);

        let blocks = content.blocks(path);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].data, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn disjoint_blocks_stay_apart() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 0, vec![1; 4]);
        content.write(path, 8, vec![2; 4]);
        assert_eq!(content.blocks(path).len(), 2);

        // the gap filler joins all three
        content.write(path, 4, vec![3; 4]);
        let blocks = content.blocks(path);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, vec![1, 1, 1, 1, 3, 3, 3, 3, 2, 2, 2, 2]);
    }

    #[test]
    fn newest_bytes_win_on_partial_overlap() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 10, vec![1; 10]);
        content.write(path, 5, vec![2; 10]);

        let blocks = content.blocks(path);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 5);
        let mut expected = vec![2; 10];
        expected.extend_from_slice(&[1; 5]);
        assert_eq!(blocks[0].data, expected);
    }

    #[test]
    fn contained_write_mutates_in_place() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 0, vec![7; 16]);
        content.write(path, 4, vec![9; 4]);

        let blocks = content.blocks(path);
        assert_eq!(blocks.len(), 1);
        let mut seen = Vec::new();
        assert!(content.read(path, 0, 16, |bytes| seen = bytes.to_vec()));
        assert_eq!(&seen[..4], &[7; 4]);
        assert_eq!(&seen[4..8], &[9; 4]);
        assert_eq!(&seen[8..], &[7; 8]);
    }

    #[test]
    fn blocks_never_overlap_or_touch_after_random_writes() {
        let mut content = Content::default();
        let path = Path::new("/f");
        let writes = [
            (0u64, 4usize),
            (2, 10),
            (30, 5),
            (20, 12),
            (35, 1),
            (100, 3),
            (99, 2),
            (7, 80),
        ];
        for (start, len) in writes {
            content.write(path, start, vec![start as u8; len]);
            let blocks = content.blocks(path);
            for pair in blocks.windows(2) {
                assert!(pair[0].end() < pair[1].start, "{pair:?}");
            }
        }
        // last write remains readable
        let mut seen = Vec::new();
        assert!(content.read(path, 7, 80, |bytes| seen = bytes.to_vec()));
        assert_eq!(seen, vec![7u8; 80]);
    }

    #[test]
    fn delete_file_forgets_path() {
        let mut content = Content::default();
        let path = Path::new("/f");
        content.write(path, 0, vec![1; 4]);
        content.delete_file(path);
        assert!(!content.read(path, 0, 4, |_| unreachable!()));
    }
}
