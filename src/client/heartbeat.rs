// CLASSIFICATION: COMMUNITY
// Filename: heartbeat.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-06-30

//! Periodic ping/pong on a high-priority queue. The observable state is
//! a single connected flag; coming back up invalidates the mirror so
//! the loader resynchronises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::client::loader::BackgroundLoader;
use crate::proto::{Payload, Pong};
use crate::relay::{Priority, ReplyTable, Scheduler};
use crate::{HEARTBEAT_PERIOD, REQUEST_TIMEOUT};

/// Connection prober driving connect/disconnect transitions.
pub struct Heartbeat {
    scheduler: Arc<Scheduler>,
    replies: Arc<ReplyTable>,
    loader: Arc<BackgroundLoader>,
    connected: AtomicBool,
    quit: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Prober wired to the loader it invalidates on reconnect.
    #[must_use]
    pub fn new(
        scheduler: Arc<Scheduler>,
        replies: Arc<ReplyTable>,
        loader: Arc<BackgroundLoader>,
    ) -> Self {
        Self {
            scheduler,
            replies,
            loader,
            connected: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Start the prober thread.
    pub fn start(self: &Arc<Self>) {
        let heartbeat = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("tetherfs-heartbeat".into())
            .spawn(move || heartbeat.run())
            .expect("spawn heartbeat thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Ask the prober to quit.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Join the prober thread.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Current link state as last probed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn run(&self) {
        info!("heartbeat start");
        let queue = self.scheduler.open_queue(Priority::HIGH);
        while !self.quit.load(Ordering::SeqCst) {
            let mid = queue.push(Payload::Ping);
            let pong: Option<Pong> = self.replies.wait(mid, REQUEST_TIMEOUT);
            if pong.is_some() {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    self.on_connect();
                }
                self.sleep_interruptibly(HEARTBEAT_PERIOD);
            } else if self.connected.swap(false, Ordering::SeqCst) {
                self.on_disconnect();
            }
        }
        info!("heartbeat done");
    }

    fn on_connect(&self) {
        info!("connected");
        self.loader.invalidate();
    }

    fn on_disconnect(&self) {
        warn!("disconnected");
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let step = Duration::from_millis(100);
        let mut remaining = total;
        while !remaining.is_zero() && !self.quit.load(Ordering::SeqCst) {
            let slice = remaining.min(step);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}
