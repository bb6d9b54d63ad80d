// CLASSIFICATION: COMMUNITY
// Filename: watcher.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-07-24

//! Change detector for the served directory. Events caused by the
//! client's own requests are silenced through a time-bounded ignore
//! set; everything else waits for the tree to stop moving and then
//! becomes one change notification on the wire.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use notify::{RecursiveMode, Watcher as _};

use crate::proto::{codec, Frame, MessageId, Payload};
use crate::server::link::ServerLink;
use crate::server::paths::{fingerprint, wire_path, FingerprintItem};

const EVENT_POLL: Duration = Duration::from_millis(200);
const STABILIZE_DELAY: Duration = Duration::from_millis(250);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Time-bounded set of paths whose next change events are self-induced
/// and must not bounce back to the client.
pub struct TemporalIgnores {
    duration: Duration,
    items: Mutex<VecDeque<(Instant, PathBuf)>>,
}

impl TemporalIgnores {
    /// Set whose entries live for `duration`.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an ignore for `path` as of `now`.
    pub fn add(&self, now: Instant, path: PathBuf) {
        // callers pass their own now, so the deque is only mostly
        // sorted; expiry tolerates that
        self.items.lock().unwrap().push_back((now, path));
    }

    /// Expire stale entries, then report whether `path` is ignored.
    pub fn check(&self, now: Instant, path: &Path) -> bool {
        let mut items = self.items.lock().unwrap();
        while let Some((stamp, _)) = items.front() {
            if now.duration_since(*stamp) > self.duration {
                items.pop_front();
            } else {
                break;
            }
        }
        items.iter().any(|(_, ignored)| ignored == path)
    }
}

/// The watcher thread.
pub struct Watcher {
    shared: Arc<WatcherShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct WatcherShared {
    root: PathBuf,
    link: Arc<ServerLink>,
    ignores: Arc<TemporalIgnores>,
    quit: AtomicBool,
}

impl Watcher {
    /// Watcher over the served root.
    #[must_use]
    pub fn new(root: PathBuf, link: Arc<ServerLink>, ignores: Arc<TemporalIgnores>) -> Self {
        Self {
            shared: Arc::new(WatcherShared {
                root,
                link,
                ignores,
                quit: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the watcher thread.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tetherfs-watcher".into())
            .spawn(move || run(&shared))
            .expect("spawn watcher thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Ask the watcher to quit.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
    }

    /// Join the watcher thread.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &WatcherShared) {
    info!("watcher start");
    while !shared.quit.load(Ordering::SeqCst) {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!("cannot create change watcher: {err}");
                std::thread::sleep(RESUBSCRIBE_DELAY);
                continue;
            }
        };
        if let Err(err) = watcher.watch(&shared.root, RecursiveMode::Recursive) {
            if is_watch_limit(&err) {
                error!("watch limit reached, raise fs.inotify.max_user_watches; change notifications are off");
                break;
            }
            error!("cannot watch {}: {err}", shared.root.display());
            std::thread::sleep(RESUBSCRIBE_DELAY);
            continue;
        }

        while !shared.quit.load(Ordering::SeqCst) {
            let event = match rx.recv_timeout(EVENT_POLL) {
                Ok(Ok(event)) => event,
                Ok(Err(err)) => {
                    warn!("watch error: {err}");
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            let Some(local) = event.paths.first() else {
                continue;
            };
            let Some(wire) = wire_path(&shared.root, local) else {
                continue;
            };
            if shared.ignores.check(Instant::now(), &wire) {
                trace!("ignored self-induced event at {}", wire.display());
                continue;
            }
            trace!("change at {}", wire.display());
            if stabilize(shared) {
                notify_changed(shared);
            }
        }
        drop(watcher);
    }
    info!("watcher done");
}

/// Local edits take a while; fingerprint until two consecutive runs
/// agree. Missing-entry races mid-edit are expected and retried.
fn stabilize(shared: &WatcherShared) -> bool {
    let mut last: Option<Vec<FingerprintItem>> = None;
    while !shared.quit.load(Ordering::SeqCst) {
        match fingerprint(&shared.root) {
            Ok(current) => {
                if last.as_ref() == Some(&current) {
                    trace!("stabilized");
                    return true;
                }
                last = Some(current);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                error!("fingerprinting failed: {err}");
                return false;
            }
        }
        std::thread::sleep(STABILIZE_DELAY);
    }
    false
}

fn notify_changed(shared: &WatcherShared) {
    let frame = codec::encode(&Frame {
        id: MessageId::UNSOLICITED,
        payload: Payload::NotifyChanged,
    });
    shared.link.send(&frame);
    info!("change notification sent");
}

fn is_watch_limit(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => true,
        notify::ErrorKind::Io(io_err) => io_err.raw_os_error() == Some(libc::ENOSPC),
        _ => false,
    }
}
