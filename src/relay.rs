// CLASSIFICATION: COMMUNITY
// Filename: relay.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-07-21

//! Transport core: a priority-aware outbound scheduler, a correlation
//! matcher for replies, and a kind-keyed dispatcher for unsolicited
//! frames. All three are shared across threads and synchronised with
//! plain mutexes and condvars.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::trace;

use crate::proto::{codec, Frame, MessageId, Payload, PayloadKind, ReplyPayload};
use crate::REQUEST_TIMEOUT;

/// Monotonic 64-bit identifier dispenser. Message and file-handle
/// identifiers come from the same family, seeded randomly per process
/// so reconnecting clients do not collide with their past selves.
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    /// Dispenser starting at the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Dispenser starting at a random seed.
    #[must_use]
    pub fn seeded() -> Self {
        Self::new(rand::random())
    }

    /// Hand out the next identifier.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Outbound queue priority; higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    /// Bulk preloading traffic.
    pub const BACKGROUND: Priority = Priority(0);
    /// Interactive file operations.
    pub const DEFAULT: Priority = Priority(10);
    /// Heartbeat probes.
    pub const HIGH: Priority = Priority(100);
}

struct Slot {
    token: u64,
    priority: Priority,
    frames: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct SchedulerState {
    queues: Vec<Slot>,
    next_token: u64,
}

/// Priority scheduler merging per-caller queues into one frame stream.
/// Frames on a single queue keep their order; across queues the highest
/// priority always drains first.
pub struct Scheduler {
    ids: IdGen,
    state: Mutex<SchedulerState>,
    ready: Condvar,
}

impl Scheduler {
    /// Scheduler whose correlation identifiers start at `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            ids: IdGen::new(seed),
            state: Mutex::new(SchedulerState::default()),
            ready: Condvar::new(),
        }
    }

    /// Scheduler with a random identifier seed.
    #[must_use]
    pub fn seeded() -> Self {
        Self {
            ids: IdGen::seeded(),
            state: Mutex::new(SchedulerState::default()),
            ready: Condvar::new(),
        }
    }

    /// Open a caller-scoped queue. Dropping the handle removes the
    /// queue on every exit path.
    pub fn open_queue(self: &Arc<Self>, priority: Priority) -> QueueHandle {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        state.queues.push(Slot {
            token,
            priority,
            frames: VecDeque::new(),
        });
        QueueHandle {
            scheduler: Arc::clone(self),
            token,
        }
    }

    /// Emit the next frame: head of the first non-empty queue in
    /// descending priority order, creation order breaking ties.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let mut best: Option<(usize, Priority)> = None;
        for (index, slot) in state.queues.iter().enumerate() {
            if slot.frames.is_empty() {
                continue;
            }
            if best.map_or(true, |(_, prio)| slot.priority > prio) {
                best = Some((index, slot.priority));
            }
        }
        let (index, _) = best?;
        state.queues[index].frames.pop_front()
    }

    /// Check whether any queue holds a frame.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.queues.iter().any(|slot| !slot.frames.is_empty())
    }

    /// Block until a frame is available or the timeout elapses.
    /// Returns true when a frame is waiting.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.queues.iter().any(|slot| !slot.frames.is_empty()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.ready.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn push(&self, token: u64, payload: Payload) -> MessageId {
        let id = MessageId::from_raw(self.ids.next());
        let frame = codec::encode(&Frame { id, payload });
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.queues.iter_mut().find(|slot| slot.token == token) {
            slot.frames.push_back(frame);
        }
        drop(state);
        self.ready.notify_one();
        id
    }

    fn drop_queue(&self, token: u64) {
        let mut state = self.state.lock().unwrap();
        state.queues.retain(|slot| slot.token != token);
    }
}

/// Caller-scoped reference to one scheduler queue.
pub struct QueueHandle {
    scheduler: Arc<Scheduler>,
    token: u64,
}

impl QueueHandle {
    /// Assign the next correlation identifier, encode the frame and
    /// append it to this queue.
    pub fn push(&self, payload: Payload) -> MessageId {
        self.scheduler.push(self.token, payload)
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.scheduler.drop_queue(self.token);
    }
}

struct PendingReply {
    arrived: Instant,
    frame: Frame,
}

/// Replies keyed by correlation identifier. Waiters block until a frame
/// with their identifier and expected payload kind arrives; a frame of
/// the wrong kind is left for the waiter it belongs to. Entries nobody
/// claims are purged once they outlive twice the request timeout.
pub struct ReplyTable {
    items: Mutex<HashMap<u64, PendingReply>>,
    arrived: Condvar,
}

impl Default for ReplyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        }
    }

    /// Record a decoded frame and wake all waiters.
    pub fn accept(&self, frame: Frame) {
        let now = Instant::now();
        let evict_after = REQUEST_TIMEOUT * 2;
        let mut items = self.items.lock().unwrap();
        items.retain(|_, pending| now.duration_since(pending.arrived) < evict_after);
        items.insert(
            frame.id.raw(),
            PendingReply {
                arrived: now,
                frame,
            },
        );
        drop(items);
        self.arrived.notify_all();
    }

    /// Decode a raw frame and record it. Malformed frames are dropped.
    pub fn process(&self, bytes: &[u8]) {
        match codec::decode(bytes) {
            Ok(frame) => self.accept(frame),
            Err(err) => trace!("dropping undecodable frame: {err}"),
        }
    }

    /// Wait for the reply with identifier `id` and payload type `T`.
    /// Returns `None` when the deadline elapses first.
    pub fn wait<T: ReplyPayload>(&self, id: MessageId, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().unwrap();
        loop {
            let matches = items
                .get(&id.raw())
                .map(|pending| pending.frame.payload.kind() == T::KIND);
            if matches == Some(true) {
                let pending = items.remove(&id.raw())?;
                return T::from_payload(pending.frame.payload);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!("timeout waiting for mid:{id}");
                return None;
            }
            let (guard, _) = self.arrived.wait_timeout(items, deadline - now).unwrap();
            items = guard;
        }
    }
}

type DispatchHandler = Box<dyn Fn(MessageId, Payload) + Send + Sync>;

/// Dispatches incoming frames by payload kind. Unsolicited frames on
/// the client and commands on the server go through here; frames with
/// no registered handler are dropped silently.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<PayloadKind, DispatchHandler>,
}

impl Dispatcher {
    /// Empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one payload kind, replacing any
    /// previous registration.
    pub fn subscribe<F>(&mut self, kind: PayloadKind, handler: F)
    where
        F: Fn(MessageId, Payload) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Decode a raw frame and run its handler. Malformed frames and
    /// unregistered kinds are dropped.
    pub fn dispatch(&self, bytes: &[u8]) {
        let frame = match codec::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!("dropping undecodable frame: {err}");
                return;
            }
        };
        match self.handlers.get(&frame.payload.kind()) {
            Some(handler) => handler(frame.id, frame.payload),
            None => trace!("no handler for {:?}", frame.payload.kind()),
        }
    }
}
