//! The tile queue: FIFO work for the render pump plus a cursor side-index.
//!
//! Producers are the control loop and the engine callback trampolines;
//! the single consumer is the pump. Payloads are opaque bytes whose first
//! token names the command. The side-index records the most recent cursor
//! rectangle per `(view, part)` so a rendering policy can elide stale
//! cursor-driven work; the queue itself never drops or reorders entries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, PoisonError};

/// Queue payload: one message, opaque bytes.
pub type Payload = Vec<u8>;

/// The sentinel payload that terminates the pump.
pub const EOF_MESSAGE: &[u8] = b"eof";

/// Latest cursor rectangle for one `(view, part)`, in twips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub width: i32,
    /// Height.
    pub height: i32,
}

#[derive(Default)]
struct Inner {
    fifo: VecDeque<Payload>,
    cursors: HashMap<(i32, i32), CursorPosition>,
}

/// FIFO of render/callback work with a replace-only cursor side-index.
#[derive(Default)]
pub struct TileQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl TileQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message without blocking.
    pub fn put(&self, payload: impl Into<Payload>) {
        let mut inner = self.lock();
        inner.fifo.push_back(payload.into());
        drop(inner);
        self.available.notify_one();
    }

    /// Enqueues the pump-terminating sentinel.
    pub fn put_eof(&self) {
        self.put(EOF_MESSAGE);
    }

    /// Removes and returns the oldest message, blocking until one exists.
    pub fn get(&self) -> Payload {
        let mut inner = self.lock();
        loop {
            if let Some(payload) = inner.fifo.pop_front() {
                return payload;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().fifo.is_empty()
    }

    /// Records the latest cursor rectangle for `(view_id, part)`.
    pub fn update_cursor_position(&self, view_id: i32, part: i32, position: CursorPosition) {
        self.lock().cursors.insert((view_id, part), position);
    }

    /// Forgets every cursor record of a view; called on view destruction.
    pub fn remove_cursor_position(&self, view_id: i32) {
        self.lock().cursors.retain(|&(view, _), _| view != view_id);
    }

    /// Latest recorded cursor rectangle for `(view_id, part)`, if any.
    #[must_use]
    pub fn cursor_position(&self, view_id: i32, part: i32) -> Option<CursorPosition> {
        self.lock().cursors.get(&(view_id, part)).copied()
    }
}
