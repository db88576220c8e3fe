//! Login session table
//!
//! Expiring, capacity-bounded map from opaque token to owner identity.
//! A background task sweeps expired entries periodically and can be
//! kicked eagerly when the table hits capacity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::crypto::IdGenerator;

/// Sliding session lifetime. Protocol-relevant: must match what clients
/// are told, not a tuning knob.
pub const SESSION_MAX_LIFETIME: Duration = Duration::from_millis(300_000);

/// Periodic sweep cadence for the cleanup task.
pub const CLEANUP_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default capacity of the table.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// One active login session.
#[derive(Debug, Clone)]
struct SessionEntry {
    owner: String,
    last_touch: Instant,
}

impl SessionEntry {
    fn is_active(&self, now: Instant, max_lifetime: Duration) -> bool {
        now.duration_since(self.last_touch) < max_lifetime
    }
}

/// Session-table failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("maximum sessions reached")]
    CapacityExceeded,
}

/// Expiring token table with background reclamation.
///
/// All mutation goes through one lock; the cleanup task is the only other
/// writer and is signaled, never detached, so `stop` leaves no dangling
/// work behind.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    max_sessions: usize,
    max_lifetime: Duration,
    ids: IdGenerator,

    /// Kicked by `request_cleanup` so a capacity failure gets an eager
    /// sweep before the caller retries.
    cleanup_signal: Notify,
    shutdown_tx: watch::Sender<bool>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            max_lifetime: SESSION_MAX_LIFETIME,
            ids: IdGenerator::new(),
            cleanup_signal: Notify::new(),
            shutdown_tx,
            cleanup_handle: Mutex::new(None),
        }
    }

    /// Override the lifetime; tests drive expiry with short windows.
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Mint a token for `owner` and store the session.
    ///
    /// At capacity this fails explicitly and kicks the cleanup task as a
    /// side effect, so an immediate retry has a chance to succeed.
    pub fn new_session(&self, owner: &str) -> Result<String, SessionError> {
        {
            let mut sessions = self.sessions.lock();
            if sessions.len() < self.max_sessions {
                let token = self.ids.next_id();
                sessions.insert(
                    token.clone(),
                    SessionEntry {
                        owner: owner.to_string(),
                        last_touch: Instant::now(),
                    },
                );
                return Ok(token);
            }
        }

        tracing::warn!(max_sessions = self.max_sessions, "session table full");
        self.request_cleanup();
        Err(SessionError::CapacityExceeded)
    }

    /// Validate `token` and, when still active, refresh its lifetime.
    ///
    /// An expired token is rejected and removed, never resurrected; a
    /// token that was never issued is indistinguishable from an expired
    /// one.
    pub fn validate_session(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        match sessions.get_mut(token) {
            Some(entry) if entry.is_active(now, self.max_lifetime) => {
                entry.last_touch = now;
                true
            }
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    /// Owner of an active session. Read-only: does not refresh the token.
    pub fn get_username_by_token(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        let sessions = self.sessions.lock();
        sessions
            .get(token)
            .filter(|entry| entry.is_active(now, self.max_lifetime))
            .map(|entry| entry.owner.clone())
    }

    /// Ask the cleanup task for an immediate sweep.
    pub fn request_cleanup(&self) {
        self.cleanup_signal.notify_one();
    }

    /// Remove every expired entry. Idempotent.
    pub fn remove_expired(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.is_active(now, self.max_lifetime));

        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "swept expired sessions");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Spawn the background sweep. Wakes on the periodic tick, on an
    /// explicit `request_cleanup`, or on shutdown.
    pub fn spawn_cleanup(self: Arc<Self>) {
        let table = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_ms = CLEANUP_INTERVAL.as_millis() as u64,
                "session cleanup task started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        table.remove_expired();
                    }
                    _ = table.cleanup_signal.notified() => {
                        table.remove_expired();
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("session cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        *self.cleanup_handle.lock() = Some(handle);
    }

    /// Signal and join the cleanup task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.cleanup_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table(capacity: usize, lifetime_ms: u64) -> SessionTable {
        SessionTable::new(capacity).with_max_lifetime(Duration::from_millis(lifetime_ms))
    }

    #[tokio::test]
    async fn test_new_session_is_immediately_valid() {
        let table = SessionTable::new(10);
        let token = table.new_session("alice").unwrap();
        assert!(table.validate_session(&token));
        assert_eq!(table.get_username_by_token(&token), Some("alice".into()));
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let table = SessionTable::new(10);
        assert!(!table.validate_session("not-a-token"));
        assert_eq!(table.get_username_by_token("not-a-token"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_monotonic() {
        let table = small_table(10, 1000);
        let token = table.new_session("alice").unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(table.validate_session(&token));

        // The validation above refreshed the clock; run past the full
        // lifetime without touching it again.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!table.validate_session(&token));
        // Rejected tokens stay rejected.
        assert!(!table.validate_session(&token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_does_not_refresh() {
        let table = small_table(10, 1000);
        let token = table.new_session("bob").unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(table.get_username_by_token(&token), Some("bob".into()));

        // If the lookup had refreshed, the token would still be alive here.
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!table.validate_session(&token));
    }

    #[tokio::test]
    async fn test_capacity_limit_is_enforced() {
        let table = small_table(3, 60_000);
        for user in ["a", "b", "c"] {
            table.new_session(user).unwrap();
        }
        assert_eq!(
            table.new_session("d"),
            Err(SessionError::CapacityExceeded)
        );
        assert_eq!(table.session_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_failure_then_cleanup_allows_retry() {
        let table = small_table(1, 100);
        table.new_session("a").unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        // First attempt still fails (the entry is expired but not swept)...
        assert!(table.new_session("b").is_err());
        // ...but an explicit sweep makes room.
        table.remove_expired();
        assert!(table.new_session("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_idempotent() {
        let table = small_table(10, 100);
        table.new_session("a").unwrap();
        table.new_session("b").unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        table.remove_expired();
        let after_first = table.session_count();
        table.remove_expired();
        assert_eq!(table.session_count(), after_first);
        assert_eq!(after_first, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_sweeps_and_stops() {
        let table = Arc::new(small_table(10, 100));
        table.clone().spawn_cleanup();
        // Let the task start and register its timers before advancing.
        tokio::task::yield_now().await;

        let token = table.new_session("a").unwrap();
        tokio::time::advance(CLEANUP_INTERVAL + Duration::from_millis(10)).await;
        // Give the spawned task a turn to run its sweep.
        tokio::task::yield_now().await;

        assert_eq!(table.session_count(), 0);
        assert!(!table.validate_session(&token));

        table.stop().await;
    }
}
