// CLASSIFICATION: COMMUNITY
// Filename: link.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-15

//! Server side of the wire. One receiver thread accepts a single client
//! at a time and feeds raw frames into a blocking queue the worker pool
//! drains; replies and notifications go out through a shared, locked
//! sender.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};

use crate::netio;
use crate::proto::compress;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

struct ServerLinkShared {
    listener: TcpListener,
    conn: Mutex<Option<TcpStream>>,
    inbound: Mutex<Option<Sender<Vec<u8>>>>,
    compress: bool,
    quit: AtomicBool,
}

/// Listening endpoint plus the receiver thread.
pub struct ServerLink {
    shared: Arc<ServerLinkShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ServerLink {
    /// Bind the endpoint. Returns the link and the queue the worker
    /// pool consumes.
    pub fn bind(endpoint: &str, compress: bool) -> Result<(Self, Receiver<Vec<u8>>)> {
        let addr = netio::parse_endpoint(endpoint)
            .with_context(|| format!("resolving endpoint '{endpoint}'"))?;
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("binding endpoint '{endpoint}'"))?;
        listener
            .set_nonblocking(true)
            .context("marking the listener non-blocking")?;
        info!("listening on {endpoint}");

        let (tx, rx) = crossbeam_channel::unbounded();
        let link = Self {
            shared: Arc::new(ServerLinkShared {
                listener,
                conn: Mutex::new(None),
                inbound: Mutex::new(Some(tx)),
                compress,
                quit: AtomicBool::new(false),
            }),
            receiver: Mutex::new(None),
        };
        Ok((link, rx))
    }

    /// Address actually bound, for callers that asked for port zero.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.listener.local_addr()?)
    }

    /// Start the receiver thread.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tetherfs-receiver".into())
            .spawn(move || run_receiver(&shared))
            .expect("spawn receiver thread");
        *self.receiver.lock().unwrap() = Some(handle);
    }

    /// Encode-agnostic send of one already-encoded frame.
    pub fn send(&self, frame: &[u8]) {
        let wire = if self.shared.compress {
            match compress::compress(frame) {
                Ok(wire) => wire,
                Err(err) => {
                    warn!("dropping frame that failed compression: {err}");
                    return;
                }
            }
        } else {
            frame.to_vec()
        };
        let mut conn = self.shared.conn.lock().unwrap();
        match conn.as_mut() {
            Some(stream) => {
                if let Err(err) = netio::write_message(stream, &wire) {
                    debug!("send failed, dropping connection: {err}");
                    let _ = stream.shutdown(Shutdown::Both);
                    *conn = None;
                }
            }
            None => trace!("no client connected, dropping frame"),
        }
    }

    /// Stop the receiver: close the inbound queue so workers drain out,
    /// sever the client connection, and stop accepting.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.inbound.lock().unwrap().take();
        let mut conn = self.shared.conn.lock().unwrap();
        if let Some(stream) = conn.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Join the receiver thread.
    pub fn join(&self) {
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_receiver(shared: &ServerLinkShared) {
    info!("receiver start");
    while !shared.quit.load(Ordering::SeqCst) {
        let (stream, peer) = match shared.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => {
                warn!("accept failed: {err}");
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
        };
        info!("client connected from {peer}");
        let _ = stream.set_nodelay(true);
        match stream.try_clone() {
            Ok(writer) => *shared.conn.lock().unwrap() = Some(writer),
            Err(err) => {
                warn!("cannot clone client stream: {err}");
                continue;
            }
        }

        let mut reader = stream;
        loop {
            let raw = match netio::read_message(&mut reader) {
                Ok(raw) => raw,
                Err(err) => {
                    if !shared.quit.load(Ordering::SeqCst) {
                        info!("client disconnected: {err}");
                    }
                    break;
                }
            };
            let frame = if shared.compress {
                match compress::decompress(&raw) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("dropping frame that failed decompression: {err}");
                        continue;
                    }
                }
            } else {
                raw
            };
            let inbound = shared.inbound.lock().unwrap();
            match inbound.as_ref() {
                Some(tx) => {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        *shared.conn.lock().unwrap() = None;
    }
    info!("receiver done");
}
