// CLASSIFICATION: COMMUNITY
// Filename: app.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-31

//! Server wiring: bind the endpoint, start the worker pool, start the
//! watcher, and unwind the lot on the quit flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use crate::server::link::ServerLink;
use crate::server::watcher::{TemporalIgnores, Watcher};
use crate::server::worker::Worker;
use crate::{DEFAULT_COMPRESS, IGNORE_DURATION};

/// Everything the server needs to come up.
pub struct ServerOptions {
    /// Endpoint to listen on, e.g. `tcp://0.0.0.0:7070`.
    pub endpoint: String,
    /// Directory served to the client.
    pub root: PathBuf,
    /// Worker thread count.
    pub workers: usize,
}

/// Run the server until the quit flag flips.
pub fn run(options: ServerOptions, quit: &AtomicBool) -> Result<()> {
    let root = std::fs::canonicalize(&options.root)
        .with_context(|| format!("resolving served directory {}", options.root.display()))?;
    info!("serving {}", root.display());

    let ignores = Arc::new(TemporalIgnores::new(IGNORE_DURATION));
    let (link, inbound) = ServerLink::bind(&options.endpoint, DEFAULT_COMPRESS)?;
    let link = Arc::new(link);
    link.start();

    let worker = Worker::new(
        root.clone(),
        Arc::clone(&link),
        Arc::clone(&ignores),
        inbound,
        options.workers,
    );
    worker.start();

    let watcher = Watcher::new(root, Arc::clone(&link), ignores);
    watcher.start();

    while !quit.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    watcher.stop();
    watcher.join();
    link.stop();
    worker.join();
    link.join();
    Ok(())
}
