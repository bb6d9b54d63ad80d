// CLASSIFICATION: COMMUNITY
// Filename: app.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-31

//! Client wiring: transport threads first, then the background loader
//! and the heartbeat, finally the kernel mount. Shutdown walks the same
//! order backwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fuser::MountOption;
use log::info;

use crate::client::cache::Cache;
use crate::client::cached::CachedVfs;
use crate::client::heartbeat::Heartbeat;
use crate::client::link::ClientLink;
use crate::client::loader::BackgroundLoader;
use crate::client::mount::Mount;
use crate::client::vfs::RemoteVfs;
use crate::proto::PayloadKind;
use crate::relay::{Dispatcher, ReplyTable, Scheduler};
use crate::DEFAULT_COMPRESS;

/// Everything the client needs to come up.
pub struct ClientOptions {
    /// Server endpoint, e.g. `tcp://host:7070`.
    pub endpoint: String,
    /// Local directory to mount at.
    pub mountpoint: PathBuf,
    /// Wire-path prefixes preloaded after every tree reload.
    pub preload: Vec<String>,
}

/// Run the client until the quit flag flips.
pub fn run(options: ClientOptions, quit: &AtomicBool) -> Result<()> {
    let scheduler = Arc::new(Scheduler::seeded());
    let replies = Arc::new(ReplyTable::new());
    let cache = Arc::new(Cache::new());

    let remote = RemoteVfs::new(Arc::clone(&scheduler), Arc::clone(&replies));
    let vfs = Arc::new(CachedVfs::new(remote, Arc::clone(&cache)));

    let loader = Arc::new(BackgroundLoader::new(
        Arc::clone(&scheduler),
        Arc::clone(&replies),
        Arc::clone(&cache),
        options.preload,
    ));

    let mut dispatcher = Dispatcher::new();
    {
        let loader = Arc::clone(&loader);
        dispatcher.subscribe(PayloadKind::NotifyChanged, move |_id, _payload| {
            info!("remote reports changes, invalidating mirror");
            loader.invalidate();
        });
    }

    let link = ClientLink::new(
        &options.endpoint,
        Arc::clone(&scheduler),
        Arc::clone(&replies),
        Arc::new(dispatcher),
        DEFAULT_COMPRESS,
    );
    link.start();
    loader.start();

    let heartbeat = Arc::new(Heartbeat::new(
        Arc::clone(&scheduler),
        Arc::clone(&replies),
        Arc::clone(&loader),
    ));
    heartbeat.start();

    let session = fuser::spawn_mount2(
        Mount::new(Arc::clone(&vfs)),
        &options.mountpoint,
        &[
            MountOption::FSName("tetherfs".to_owned()),
            MountOption::DefaultPermissions,
        ],
    )
    .with_context(|| format!("mounting at {}", options.mountpoint.display()))?;
    info!("mounted at {}", options.mountpoint.display());

    while !quit.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("unmounting");
    drop(session);
    heartbeat.stop();
    heartbeat.join();
    loader.stop();
    loader.join();
    link.stop();
    link.join();
    Ok(())
}
