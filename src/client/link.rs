// CLASSIFICATION: COMMUNITY
// Filename: link.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-11

//! Client side of the wire: a reader thread feeding the reply table and
//! the dispatcher, and a writer thread draining the scheduler. The
//! reader owns reconnection; everything above the link only ever sees
//! frames.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::netio;
use crate::proto::compress;
use crate::relay::{Dispatcher, ReplyTable, Scheduler};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const WRITER_IDLE_WAIT: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct LinkShared {
    endpoint: String,
    conn: Mutex<Option<TcpStream>>,
    scheduler: Arc<Scheduler>,
    replies: Arc<ReplyTable>,
    dispatcher: Arc<Dispatcher>,
    compress: bool,
    quit: AtomicBool,
}

impl LinkShared {
    fn current_conn(&self) -> Option<TcpStream> {
        let conn = self.conn.lock().unwrap();
        conn.as_ref().and_then(|stream| stream.try_clone().ok())
    }

    fn drop_conn(&self) {
        let mut conn = self.conn.lock().unwrap();
        if let Some(stream) = conn.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn establish(&self) -> Option<TcpStream> {
        if let Some(stream) = self.current_conn() {
            return Some(stream);
        }
        let addr = match netio::parse_endpoint(&self.endpoint) {
            Ok(addr) => addr,
            Err(err) => {
                warn!("bad endpoint '{}': {err}", self.endpoint);
                return None;
            }
        };
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                info!("connected to {}", self.endpoint);
                let reader = stream.try_clone().ok()?;
                *self.conn.lock().unwrap() = Some(stream);
                Some(reader)
            }
            Err(err) => {
                debug!("connect to {} failed: {err}", self.endpoint);
                None
            }
        }
    }
}

/// The client transport threads.
pub struct ClientLink {
    shared: Arc<LinkShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ClientLink {
    /// Link to `endpoint`; nothing connects until `start`.
    #[must_use]
    pub fn new(
        endpoint: &str,
        scheduler: Arc<Scheduler>,
        replies: Arc<ReplyTable>,
        dispatcher: Arc<Dispatcher>,
        compress: bool,
    ) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                endpoint: endpoint.to_owned(),
                conn: Mutex::new(None),
                scheduler,
                replies,
                dispatcher,
                compress,
                quit: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Start the reader and writer threads.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let reader = std::thread::Builder::new()
            .name("tetherfs-reader".into())
            .spawn(move || run_reader(&shared))
            .expect("spawn reader thread");
        *self.reader.lock().unwrap() = Some(reader);

        let shared = Arc::clone(&self.shared);
        let writer = std::thread::Builder::new()
            .name("tetherfs-writer".into())
            .spawn(move || run_writer(&shared))
            .expect("spawn writer thread");
        *self.writer.lock().unwrap() = Some(writer);
    }

    /// Ask both threads to quit and sever the connection so blocking
    /// reads return.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.drop_conn();
    }

    /// Join both threads.
    pub fn join(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_reader(shared: &LinkShared) {
    info!("starting reader");
    while !shared.quit.load(Ordering::SeqCst) {
        let Some(mut stream) = shared.establish() else {
            std::thread::sleep(RECONNECT_DELAY);
            continue;
        };
        loop {
            let raw = match netio::read_message(&mut stream) {
                Ok(raw) => raw,
                Err(err) => {
                    if !shared.quit.load(Ordering::SeqCst) {
                        debug!("link read failed: {err}");
                    }
                    shared.drop_conn();
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
            shared.replies.process(&frame);
            shared.dispatcher.dispatch(&frame);
        }
    }
    info!("reader done");
}

fn run_writer(shared: &LinkShared) {
    info!("starting writer");
    while !shared.quit.load(Ordering::SeqCst) {
        while let Some(frame) = shared.scheduler.pop() {
            let wire = if shared.compress {
                match compress::compress(&frame) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!("dropping frame that failed compression: {err}");
                        continue;
                    }
                }
            } else {
                frame
            };
            match shared.current_conn() {
                Some(mut stream) => {
                    if let Err(err) = netio::write_message(&mut stream, &wire) {
                        debug!("link write failed: {err}");
                        shared.drop_conn();
                    }
                }
                None => trace!("no connection, dropping outbound frame"),
            }
        }
        shared.scheduler.wait(WRITER_IDLE_WAIT);
    }
    info!("writer done");
}
