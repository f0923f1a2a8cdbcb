//! # Bounded Message Queues
//!
//! Named, FIFO, in-process queues of variable-length byte messages. They
//! are the only shared resource between tasks; every lock and wait lives
//! in here, callers never see one.
//!
//! ```text
//!   QueueRegistry ── name ──► Entry { queue, participants }
//!        │                           │
//!     create / bind                  ▼
//!        │                    ┌─────────────────────────────┐
//!        └──► QueueHandle ──► │ Mutex<VecDeque<Message>>    │
//!             QueueHandle ──► │ space_available   (Condvar) │
//!             QueueHandle ──► │ message_available (Condvar) │
//!                             └─────────────────────────────┘
//! ```
//!
//! ## Semantics
//!
//! - `send` moves the message in. A full bounded queue blocks the sender
//!   (or fails with `QueueFull` in non-blocking mode); nothing is dropped
//!   or reordered.
//! - `receive` blocks while the queue is empty and open. Once the queue is
//!   closed, pending messages are still delivered, then `None` marks end
//!   of stream.
//! - Every handle is a participant. The registry entry is reclaimed when
//!   the last participant (creator included) releases, after which the
//!   name can be created again.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{HarnessError, NameKind, Result};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A variable-length byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message(Vec<u8>);

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Maximum number of buffered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(usize),
    Unbounded,
}

/// Delivery order. FIFO is the only order the harness needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    #[default]
    Fifo,
}

/// Behaviour of `send` on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Wait for a receiver to free a slot.
    #[default]
    Blocking,
    /// Fail with `QueueFull`.
    NonBlocking,
}

/// How long `bind` waits for a queue name to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTimeout {
    NonBlocking,
    After(std::time::Duration),
    Infinite,
}

/// Creation parameters of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub capacity: Capacity,
    pub policy: QueuePolicy,
    pub send_mode: SendMode,
}

impl QueueOptions {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Capacity::Bounded(capacity),
            policy: QueuePolicy::Fifo,
            send_mode: SendMode::Blocking,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            capacity: Capacity::Unbounded,
            policy: QueuePolicy::Fifo,
            send_mode: SendMode::Blocking,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.send_mode = SendMode::NonBlocking;
        self
    }
}

/// Outcome of [`QueueHandle::receive_timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimedReceive {
    Message(Message),
    TimedOut,
    /// Closed and drained.
    Closed,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug)]
struct QueueShared {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    /// Notifies senders when a slot frees up or the queue closes.
    space_available: Condvar,
    /// Notifies receivers when a message arrives or the queue closes.
    message_available: Condvar,
}

impl QueueShared {
    fn new(name: String, options: QueueOptions) -> Self {
        let initial = match options.capacity {
            Capacity::Bounded(n) => n,
            Capacity::Unbounded => 0,
        };
        Self {
            name,
            options,
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(initial),
                closed: false,
            }),
            space_available: Condvar::new(),
            message_available: Condvar::new(),
        }
    }

    fn is_full(&self, state: &QueueState) -> bool {
        match self.options.capacity {
            Capacity::Bounded(n) => state.messages.len() >= n,
            Capacity::Unbounded => false,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(queue = %self.name, pending = state.messages.len(), "queue closed");
        }
        self.space_available.notify_all();
        self.message_available.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    queue: Arc<QueueShared>,
    participants: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, Entry>>,
    /// Wakes binders waiting for a name to be created.
    created: Condvar,
}

/// Namespace of named queues. Clones share the same namespace.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queue and return the creator's handle.
    pub fn create(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        if options.capacity == Capacity::Bounded(0) {
            return Err(HarnessError::ResourceExhausted(format!(
                "queue {name} needs a non-zero capacity"
            )));
        }

        let mut entries = self.inner.entries.lock();
        let queue = match entries.entry(name.to_string()) {
            MapEntry::Occupied(_) => {
                return Err(HarnessError::DuplicateName {
                    kind: NameKind::Queue,
                    name: name.to_string(),
                })
            }
            MapEntry::Vacant(slot) => {
                let queue = Arc::new(QueueShared::new(name.to_string(), options));
                slot.insert(Entry {
                    queue: Arc::clone(&queue),
                    participants: 1,
                });
                queue
            }
        };
        self.inner.created.notify_all();
        debug!(queue = name, capacity = ?options.capacity, "queue created");

        Ok(QueueHandle {
            registry: Arc::clone(&self.inner),
            queue,
        })
    }

    /// Resolve an existing queue by name, waiting up to `timeout` for it to
    /// be created.
    pub fn bind(&self, name: &str, timeout: BindTimeout) -> Result<QueueHandle> {
        let deadline = match timeout {
            BindTimeout::After(d) => Some(std::time::Instant::now() + d),
            _ => None,
        };

        let mut entries = self.inner.entries.lock();
        loop {
            if let Some(entry) = entries.get_mut(name) {
                entry.participants += 1;
                return Ok(QueueHandle {
                    registry: Arc::clone(&self.inner),
                    queue: Arc::clone(&entry.queue),
                });
            }

            match (timeout, deadline) {
                (BindTimeout::Infinite, _) => self.inner.created.wait(&mut entries),
                (BindTimeout::After(_), Some(deadline)) => {
                    let timed_out = self
                        .inner
                        .created
                        .wait_until(&mut entries, deadline)
                        .timed_out();
                    if timed_out && !entries.contains_key(name) {
                        return Err(HarnessError::QueueNotFound(name.to_string()));
                    }
                }
                _ => return Err(HarnessError::QueueNotFound(name.to_string())),
            }
        }
    }

    /// Whether a queue with this name is currently registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.entries.lock().contains_key(name)
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered queue, waking all blocked senders and
    /// receivers.
    pub fn close_all(&self) {
        let queues: Vec<Arc<QueueShared>> = self
            .inner
            .entries
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.queue))
            .collect();
        for queue in queues {
            queue.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A participant's reference to a queue. Dropping it unbinds.
///
/// Cloning registers another participant.
pub struct QueueHandle {
    registry: Arc<RegistryInner>,
    queue: Arc<QueueShared>,
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.queue.name)
            .field("options", &self.queue.options)
            .finish_non_exhaustive()
    }
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn capacity(&self) -> Capacity {
        self.queue.options.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.queue.state.lock().closed
    }

    /// Enqueue a message according to the queue's send mode.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        match self.queue.options.send_mode {
            SendMode::Blocking => self.send_blocking(message.into()),
            SendMode::NonBlocking => self.try_send(message),
        }
    }

    /// Enqueue without waiting; fails with `QueueFull` if no slot is free.
    pub fn try_send(&self, message: impl Into<Message>) -> Result<()> {
        let mut state = self.queue.state.lock();
        if state.closed {
            return Err(HarnessError::QueueClosed(self.queue.name.clone()));
        }
        if self.queue.is_full(&state) {
            return Err(HarnessError::QueueFull(self.queue.name.clone()));
        }
        state.messages.push_back(message.into());
        drop(state);
        self.queue.message_available.notify_one();
        Ok(())
    }

    fn send_blocking(&self, message: Message) -> Result<()> {
        let mut state = self.queue.state.lock();
        loop {
            if state.closed {
                return Err(HarnessError::QueueClosed(self.queue.name.clone()));
            }
            if !self.queue.is_full(&state) {
                state.messages.push_back(message);
                drop(state);
                self.queue.message_available.notify_one();
                return Ok(());
            }
            self.queue.space_available.wait(&mut state);
        }
    }

    /// Dequeue the oldest message, blocking while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub fn receive(&self) -> Option<Message> {
        let mut state = self.queue.state.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                drop(state);
                self.queue.space_available.notify_one();
                return Some(message);
            }
            if state.closed {
                return None;
            }
            self.queue.message_available.wait(&mut state);
        }
    }

    /// Like [`QueueHandle::receive`], giving up after `timeout`.
    pub fn receive_timeout(&self, timeout: std::time::Duration) -> TimedReceive {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.queue.state.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                drop(state);
                self.queue.space_available.notify_one();
                return TimedReceive::Message(message);
            }
            if state.closed {
                return TimedReceive::Closed;
            }
            if self
                .queue
                .message_available
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.messages.is_empty()
                && !state.closed
            {
                return TimedReceive::TimedOut;
            }
        }
    }

    /// Mark end of stream. Pending messages stay receivable; further sends
    /// fail with `QueueClosed`.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Release this participant.
    pub fn unbind(self) {
        drop(self);
    }
}

impl Clone for QueueHandle {
    fn clone(&self) -> Self {
        let mut entries = self.registry.entries.lock();
        if let Some(entry) = entries.get_mut(&self.queue.name) {
            if Arc::ptr_eq(&entry.queue, &self.queue) {
                entry.participants += 1;
            }
        }
        Self {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock();
        let reclaim = match entries.get_mut(&self.queue.name) {
            Some(entry) if Arc::ptr_eq(&entry.queue, &self.queue) => {
                entry.participants = entry.participants.saturating_sub(1);
                entry.participants == 0
            }
            _ => false,
        };
        if reclaim {
            entries.remove(&self.queue.name);
            debug!(queue = %self.queue.name, "queue reclaimed");
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
