// CLASSIFICATION: COMMUNITY
// Filename: loader.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-18

//! Background reconciler. When the remote signals change (or the link
//! comes back), it fetches the whole attribute tree, swaps the mirror
//! wholesale, and prereads a configured set of paths in bounded bulks
//! on the lowest-priority queue so interactive traffic stays ahead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::client::cache::{Cache, Node};
use crate::proto::{
    wire_err, MessageId, Payload, PrereadResult, TreeNode, TreeResult,
};
use crate::relay::{Priority, QueueHandle, ReplyTable, Scheduler};
use crate::{IO_FRAGMENT_SIZE, PRELOAD_BULK_BYTES, REQUEST_TIMEOUT, TREE_TIMEOUT};

#[derive(Default)]
struct LoaderFlags {
    invalidated: bool,
    quit: bool,
}

/// Reloads the mirror when told to. `invalidate` may be called from
/// any thread; cycles coalesce when signals arrive back to back.
pub struct BackgroundLoader {
    scheduler: Arc<Scheduler>,
    replies: Arc<ReplyTable>,
    cache: Arc<Cache>,
    preload: Vec<String>,
    flags: Mutex<LoaderFlags>,
    wake: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundLoader {
    /// Loader preloading files whose wire path starts with one of the
    /// given prefixes.
    #[must_use]
    pub fn new(
        scheduler: Arc<Scheduler>,
        replies: Arc<ReplyTable>,
        cache: Arc<Cache>,
        preload: Vec<String>,
    ) -> Self {
        Self {
            scheduler,
            replies,
            cache,
            preload,
            flags: Mutex::new(LoaderFlags::default()),
            wake: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread.
    pub fn start(self: &Arc<Self>) {
        let loader = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("tetherfs-loader".into())
            .spawn(move || loader.run())
            .expect("spawn loader thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Mark the mirror stale and wake the worker.
    pub fn invalidate(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.invalidated = true;
        drop(flags);
        self.wake.notify_one();
    }

    /// Ask the worker to quit.
    pub fn stop(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.quit = true;
        drop(flags);
        self.wake.notify_one();
    }

    /// Join the worker thread.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn quitting(&self) -> bool {
        self.flags.lock().unwrap().quit
    }

    fn run(&self) {
        info!("loader start");
        loop {
            {
                let mut flags = self.flags.lock().unwrap();
                while !flags.invalidated && !flags.quit {
                    flags = self.wake.wait(flags).unwrap();
                }
                if flags.quit {
                    break;
                }
                flags.invalidated = false;
            }
            self.reload();
        }
        info!("loader done");
    }

    fn reload(&self) {
        info!("fetching remote tree");
        let queue = self.scheduler.open_queue(Priority::BACKGROUND);
        let mid = queue.push(Payload::ReadTree { path: "/".into() });
        let Some(result) = self.replies.wait::<TreeResult>(mid, TREE_TIMEOUT) else {
            warn!("tree fetch timed out");
            return;
        };
        if let Err(err) = wire_err(result.err) {
            warn!("tree fetch failed: {err}");
            return;
        }
        let Some(tree) = result.tree else {
            warn!("tree fetch returned no tree");
            return;
        };

        let plan = {
            let mut state = self.cache.lock();
            state.reset();
            populate(state.tree.root_mut(), &tree);
            collect_preloads(state.tree.root(), &self.preload)
        };
        info!("tree loaded, preloading {} file(s)", plan.len());
        self.preload_files(&plan, &queue);
    }

    /// Queue fragment-sized preread commands and collect each bulk's
    /// replies before queueing the next, so at most a bulk budget is in
    /// flight.
    fn preload_files(&self, plan: &[(PathBuf, u64)], queue: &QueueHandle) {
        let mut bulk: Vec<(MessageId, PathBuf, u64)> = Vec::new();
        let mut queued = 0usize;
        for (path, size) in plan {
            let Some(wire) = path.to_str() else {
                continue;
            };
            let mut offset = 0u64;
            while offset < *size {
                if self.quitting() {
                    return;
                }
                let len = (*size - offset).min(IO_FRAGMENT_SIZE as u64) as u32;
                let mid = queue.push(Payload::Preread {
                    path: wire.to_owned(),
                    offset,
                    size: len,
                });
                bulk.push((mid, path.clone(), offset));
                queued += len as usize;
                offset += u64::from(len);
                if queued >= PRELOAD_BULK_BYTES {
                    self.drain_bulk(&mut bulk);
                    queued = 0;
                }
            }
        }
        self.drain_bulk(&mut bulk);
    }

    fn drain_bulk(&self, bulk: &mut Vec<(MessageId, PathBuf, u64)>) {
        for (mid, path, offset) in bulk.drain(..) {
            if self.quitting() {
                return;
            }
            match self.replies.wait::<PrereadResult>(mid, REQUEST_TIMEOUT) {
                Some(result) if result.err == 0 => {
                    let mut state = self.cache.lock();
                    state.content.write(&path, offset, result.data);
                }
                Some(result) => {
                    debug!("preread of {} failed: code {}", path.display(), result.err);
                }
                None => debug!("preread of {} timed out", path.display()),
            }
        }
    }
}

fn populate(node: &mut Node, source: &TreeNode) {
    node.attrs = source.attrs;
    for child in &source.children {
        let entry = node
            .children
            .entry(child.name.clone())
            .or_insert_with(|| Node::new(child.name.clone()));
        populate(entry, child);
    }
}

fn collect_preloads(root: &Node, prefixes: &[String]) -> Vec<(PathBuf, u64)> {
    if prefixes.is_empty() {
        return Vec::new();
    }
    let mut plan = Vec::new();
    walk(root, Path::new("/"), prefixes, &mut plan);
    plan
}

fn walk(node: &Node, at: &Path, prefixes: &[String], plan: &mut Vec<(PathBuf, u64)>) {
    for (name, child) in &node.children {
        let path = at.join(name);
        if child.attrs.is_file() && child.attrs.size > 0 {
            if let Some(text) = path.to_str() {
                if prefixes.iter().any(|prefix| text.starts_with(prefix.as_str())) {
                    plan.push((path.clone(), child.attrs.size));
                }
            }
        }
        walk(child, &path, prefixes, plan);
    }
}
