// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-29

//! tetherfs mounts a remote directory locally. The client mirrors the
//! server's attribute tree and recently read file content to mask link
//! latency; writes go through to the server before the mirror is
//! updated, and a server-side watcher tells the client when local edits
//! on the served directory require a reload.

use std::time::Duration;

pub mod client;
pub mod netio;
pub mod proto;
pub mod relay;
pub mod server;

/// Large reads and writes are chopped into fragments of this size so a
/// slow link keeps interleaving progress with other traffic.
pub const IO_FRAGMENT_SIZE: usize = 32 * 1024;

/// Deadline for a single request/reply round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the bulk attribute-tree fetch, which can be much larger
/// than any single command.
pub const TREE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between heartbeat pings.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on preread bytes in flight during background preloading.
pub const PRELOAD_BULK_BYTES: usize = 1024 * 1024;

/// How long a server-side mutation suppresses the watcher event it
/// triggers.
pub const IGNORE_DURATION: Duration = Duration::from_secs(1);

/// Both endpoints compress frames; there is no negotiation handshake.
pub const DEFAULT_COMPRESS: bool = true;
