//! Thread-safe FIFO queue with an async wait
//!
//! The sole hand-off point between network I/O tasks and processing logic:
//! connections push inbound requests here, the dispatch loop drains them,
//! and each connection's write pump drains its own outbound instance. It
//! owns no business semantics.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Generic FIFO safe under arbitrary concurrent callers.
///
/// `push` is non-blocking and wakes one parked `wait()`er; `wait()` suspends
/// the calling task (never a thread) until the queue is non-empty,
/// re-checking on every wake so spurious wakeups are harmless.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Append an item and wake one waiter, if any.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Remove and return the oldest item.
    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove and return the newest item.
    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Suspend until the queue is non-empty.
    ///
    /// The emptiness check is re-run after every wakeup; a `notify_one`
    /// that races an item being popped by another task simply loops back
    /// to waiting.
    pub async fn wait(&self) {
        loop {
            // Register interest before the emptiness check so a push that
            // lands in between still wakes this waiter.
            let notified = self.ready.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
