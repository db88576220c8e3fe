//! Transaction correlation buffer
//!
//! The gateway answers some requests with only an "ack"; the real result
//! surfaces later on the shared long-poll channel, tagged with the caller's
//! transaction id. This buffer bridges the two without busy polling: a
//! push either completes a parked waiter or is stored for a later wait,
//! and a wait either finds a stored message or parks until delivery or
//! timeout. One lock serializes pushes against waits so the
//! "message already arrived" check and "start waiting" are never racing.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Duration;

use super::messages::SignalingMessage;

/// Matches the gateway's own long-poll cadence. Protocol-relevant.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlation failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CorrelationError {
    /// No message arrived for the transaction within the timeout.
    #[error("timed out waiting for transaction {0}")]
    TimedOut(String),

    /// Another task is already parked on this transaction id. Caller bug;
    /// waits are never merged.
    #[error("a waiter already exists for transaction {0}")]
    DuplicateWaiter(String),

    /// The buffer was closed (client shutdown) while waiting.
    #[error("correlation buffer closed")]
    Closed,
}

struct Waiter {
    seq: u64,
    deliver: oneshot::Sender<SignalingMessage>,
}

#[derive(Default)]
struct Inner {
    buffered: VecDeque<SignalingMessage>,
    waiters: HashMap<String, Waiter>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn take_buffered(&mut self, transaction: &str) -> Option<SignalingMessage> {
        let index = self
            .buffered
            .iter()
            .position(|m| m.transaction == transaction)?;
        self.buffered.remove(index)
    }
}

/// See module docs. Owned by the signaling client; pushed into by its
/// long-poll loop, waited on by any request task.
pub struct CorrelationBuffer {
    inner: Mutex<Inner>,
}

impl Default for CorrelationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Deliver `message` to a parked waiter for its transaction, or buffer
    /// it for a later wait.
    pub fn push(&self, message: SignalingMessage) {
        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::debug!(transaction = %message.transaction, "dropping message after close");
            return;
        }

        if let Some(waiter) = inner.waiters.remove(&message.transaction) {
            // Receiver may already be gone if the wait timed out at this
            // exact moment; the message is then dropped, matching a plain
            // timeout from the caller's point of view.
            let _ = waiter.deliver.send(message);
            return;
        }

        inner.buffered.push_back(message);
    }

    /// Wait until a message for `transaction` arrives, up to `timeout`.
    ///
    /// A message that already arrived is returned immediately without
    /// parking. The waiter entry is always gone by the time this returns,
    /// whatever the outcome.
    pub async fn wait_for_transaction(
        &self,
        transaction: &str,
        timeout: Duration,
    ) -> Result<SignalingMessage, CorrelationError> {
        let (seq, rx) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CorrelationError::Closed);
            }

            if let Some(found) = inner.take_buffered(transaction) {
                return Ok(found);
            }

            if inner.waiters.contains_key(transaction) {
                tracing::error!(transaction, "duplicate wait for transaction");
                return Err(CorrelationError::DuplicateWaiter(transaction.to_string()));
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;

            let (tx, rx) = oneshot::channel();
            inner
                .waiters
                .insert(transaction.to_string(), Waiter { seq, deliver: tx });
            (seq, rx)
        };

        let outcome = tokio::time::timeout(timeout, rx).await;

        // On delivery the pusher already removed the waiter; on timeout or
        // close it is still ours to clean up. The seq guard keeps a
        // follow-up waiter for the same id from being evicted by accident.
        {
            let mut inner = self.inner.lock();
            if inner
                .waiters
                .get(transaction)
                .is_some_and(|w| w.seq == seq)
            {
                inner.waiters.remove(transaction);
            }
        }

        match outcome {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(CorrelationError::Closed),
            Err(_) => Err(CorrelationError::TimedOut(transaction.to_string())),
        }
    }

    /// Abandon all parked waiters and refuse further traffic. Dropping the
    /// delivery handles resolves every pending wait with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
        inner.buffered.clear();
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.inner.lock().buffered.len()
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message(transaction: &str) -> SignalingMessage {
        SignalingMessage {
            event_type: "event".to_string(),
            transaction: transaction.to_string(),
            body: serde_json::json!({"tx": transaction}),
        }
    }

    #[tokio::test]
    async fn test_buffered_message_returns_instantly() {
        let buffer = CorrelationBuffer::new();
        buffer.push(message("tx1"));

        let got = buffer
            .wait_for_transaction("tx1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.transaction, "tx1");
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_push_wakes_active_waiter() {
        let buffer = Arc::new(CorrelationBuffer::new());

        let wait = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer
                    .wait_for_transaction("tx2", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(message("tx2"));

        let got = wait.await.unwrap().unwrap();
        assert_eq!(got.transaction, "tx2");
        assert_eq!(buffer.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_schedule() {
        let buffer = CorrelationBuffer::new();
        let start = tokio::time::Instant::now();

        let result = buffer
            .wait_for_transaction("tx3", Duration::from_millis(100))
            .await;

        assert_eq!(
            result,
            Err(CorrelationError::TimedOut("tx3".to_string()))
        );
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(buffer.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_wait_fails_immediately() {
        let buffer = Arc::new(CorrelationBuffer::new());

        let first = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer
                    .wait_for_transaction("tx4", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The second wait on the same id must not block or disturb the first.
        let second = buffer
            .wait_for_transaction("tx4", Duration::from_secs(5))
            .await;
        assert_eq!(
            second,
            Err(CorrelationError::DuplicateWaiter("tx4".to_string()))
        );

        buffer.push(message("tx4"));
        let got = first.await.unwrap().unwrap();
        assert_eq!(got.transaction, "tx4");
    }

    #[tokio::test]
    async fn test_unrelated_messages_stay_buffered() {
        let buffer = CorrelationBuffer::new();
        buffer.push(message("other"));

        let result = buffer
            .wait_for_transaction("mine", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CorrelationError::TimedOut(_))));
        assert_eq!(buffer.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_close_resolves_parked_waiters() {
        let buffer = Arc::new(CorrelationBuffer::new());

        let wait = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer
                    .wait_for_transaction("tx5", Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        buffer.close();
        assert_eq!(wait.await.unwrap(), Err(CorrelationError::Closed));

        // Closed buffer fails fast for new callers.
        assert_eq!(
            buffer
                .wait_for_transaction("tx6", Duration::from_secs(1))
                .await,
            Err(CorrelationError::Closed)
        );
    }

    #[tokio::test]
    async fn test_waiter_slot_reusable_after_timeout() {
        let buffer = CorrelationBuffer::new();

        let first = buffer
            .wait_for_transaction("tx7", Duration::from_millis(20))
            .await;
        assert!(matches!(first, Err(CorrelationError::TimedOut(_))));

        buffer.push(message("tx7"));
        let second = buffer
            .wait_for_transaction("tx7", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(second.transaction, "tx7");
    }
}
