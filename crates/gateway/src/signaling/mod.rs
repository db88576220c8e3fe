//! Signaling gateway client
//!
//! Speaks JSON-over-HTTP to the external media gateway: a dedicated
//! long-poll task feeds deferred results into the correlation buffer,
//! while every outbound action goes over a fresh ephemeral connection and
//! reads exactly one immediate response. An `ack` immediate response means
//! the real result must be awaited through the buffer under the request's
//! transaction id.

pub mod correlation;
pub mod messages;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::crypto::IdGenerator;
use correlation::{CorrelationBuffer, CorrelationError, WAIT_TIMEOUT};
use messages::{
    AttachPluginRequest, CreateSessionRequest, MessageError, PluginRequest, SignalingMessage,
};

/// Per-exchange timeout for ephemeral one-shot requests.
const ONESHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before re-polling after a long-poll failure.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consecutive long-poll failures tolerated before the loop gives up.
const MAX_POLL_FAILURES: u32 = 5;

/// Signaling failures. All of them surface to business logic as a failed
/// exchange; none of them take the process down.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling client is not ready")]
    NotReady,

    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("gateway init failed at {0}")]
    Init(&'static str),
}

/// Path segments addressing the attached plugin handle.
#[derive(Debug, Clone)]
struct GatewayPaths {
    session: String,
    handle: String,
}

/// Client for the signaling gateway. One explicitly owned instance;
/// lifecycle (`init`/`stop`) is part of its contract.
pub struct SignalingClient {
    base_url: String,
    plugin: String,

    /// Ephemeral one-shot connections: pooling disabled so every exchange
    /// opens, speaks once and closes.
    oneshot_http: reqwest::Client,
    /// Keep-alive client owned by the long-poll loop; nothing else reads
    /// from it.
    poll_http: reqwest::Client,

    buffer: Arc<CorrelationBuffer>,
    ids: IdGenerator,
    paths: RwLock<Option<GatewayPaths>>,

    shutdown_tx: watch::Sender<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Build a client for `http://host:port`. No I/O happens until `init`.
    pub fn new(host: &str, port: u16, plugin: &str) -> Result<Self, SignalingError> {
        let oneshot_http = reqwest::Client::builder()
            .timeout(ONESHOT_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()?;
        let poll_http = reqwest::Client::builder()
            .timeout(WAIT_TIMEOUT + Duration::from_secs(5))
            .build()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            plugin: plugin.to_string(),
            oneshot_http,
            poll_http,
            buffer: Arc::new(CorrelationBuffer::new()),
            ids: IdGenerator::new(),
            paths: RwLock::new(None),
            shutdown_tx,
            poll_handle: Mutex::new(None),
        })
    }

    /// Whether the startup sequence completed. Requests fail fast with
    /// [`SignalingError::NotReady`] until it has.
    pub fn is_ready(&self) -> bool {
        self.paths.read().is_some()
    }

    /// Addressable plugin path, e.g. `/janus/42/77`.
    pub fn plugin_path(&self) -> Option<String> {
        self.paths
            .read()
            .as_ref()
            .map(|p| format!("/janus/{}/{}", p.session, p.handle))
    }

    /// Startup sequence: create a gateway session, attach the plugin, then
    /// start the long-poll loop. Failure at any step leaves the client not
    /// ready.
    pub async fn init(self: Arc<Self>) -> Result<(), SignalingError> {
        let create_tx = self.ids.next_id();
        let created = self
            .exchange("/janus", &CreateSessionRequest::new(create_tx))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "gateway session create failed");
                SignalingError::Init("create-session")
            })?;
        let session = created
            .data_id()
            .map_err(|_| SignalingError::Init("create-session"))?;

        let attach_tx = self.ids.next_id();
        let attached = self
            .exchange(
                &format!("/janus/{}", session),
                &AttachPluginRequest::new(attach_tx, &self.plugin),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "gateway plugin attach failed");
                SignalingError::Init("attach-plugin")
            })?;
        let handle = attached
            .data_id()
            .map_err(|_| SignalingError::Init("attach-plugin"))?;

        *self.paths.write() = Some(GatewayPaths {
            session: session.clone(),
            handle,
        });

        let poll_task = {
            let client = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                client.long_poll_loop(session, shutdown_rx).await;
            })
        };
        *self.poll_handle.lock() = Some(poll_task);

        tracing::info!(path = %self.plugin_path().unwrap_or_default(), "signaling client ready");
        Ok(())
    }

    /// Stop the long-poll loop, join it, and abandon any parked waiters.
    /// No gateway I/O is in flight once this returns.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.buffer.close();
        *self.paths.write() = None;
        tracing::info!("signaling client stopped");
    }

    /// Query static gateway info (no session required).
    pub async fn server_info(&self) -> Result<SignalingMessage, SignalingError> {
        let url = format!("{}/janus/info", self.base_url);
        let raw = self
            .oneshot_http
            .get(&url)
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await?
            .text()
            .await?;
        Ok(SignalingMessage::parse(&raw)?)
    }

    /// Create a conference room on the attached plugin.
    pub async fn create_room(&self) -> Result<SignalingMessage, SignalingError> {
        let request = PluginRequest::create_room(self.ids.next_id());
        self.plugin_exchange(&request).await
    }

    /// List the participants of an existing room.
    pub async fn list_participants(
        &self,
        room: &str,
    ) -> Result<SignalingMessage, SignalingError> {
        let request = PluginRequest::list_participants(self.ids.next_id(), room);
        self.plugin_exchange(&request).await
    }

    async fn plugin_exchange(
        &self,
        request: &PluginRequest,
    ) -> Result<SignalingMessage, SignalingError> {
        let path = self.plugin_path().ok_or(SignalingError::NotReady)?;
        self.exchange(&path, request).await
    }

    /// One ephemeral request/response cycle, unified over the ack-vs-direct
    /// pattern: an `ack` reply parks on the correlation buffer for the
    /// deferred result under the same transaction id.
    async fn exchange<T: serde::Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<SignalingMessage, SignalingError> {
        let url = format!("{}{}", self.base_url, path);
        let raw = self
            .oneshot_http
            .post(&url)
            .header(reqwest::header::CONNECTION, "close")
            .json(payload)
            .send()
            .await?
            .text()
            .await?;

        let immediate = SignalingMessage::parse(&raw)?;
        if !immediate.is_ack() {
            return Ok(immediate);
        }

        tracing::debug!(
            transaction = %immediate.transaction,
            "ack received, awaiting deferred result"
        );
        Ok(self
            .buffer
            .wait_for_transaction(&immediate.transaction, WAIT_TIMEOUT)
            .await?)
    }

    /// Long-poll loop: request the next event, feed anything that is not a
    /// keep-alive into the correlation buffer, poll again. Exits on
    /// shutdown or after too many consecutive transport failures.
    async fn long_poll_loop(&self, session: String, mut shutdown_rx: watch::Receiver<bool>) {
        let url = format!("{}/janus/{}?maxev=1", self.base_url, session);
        let mut failures: u32 = 0;

        loop {
            let outcome = tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::info!("long-poll loop shutting down");
                    return;
                }
                outcome = self.poll_once(&url) => outcome,
            };

            match outcome {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "long-poll request failed");
                    if failures >= MAX_POLL_FAILURES {
                        tracing::error!("long-poll loop giving up after repeated failures");
                        *self.paths.write() = None;
                        return;
                    }
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn poll_once(&self, url: &str) -> Result<(), SignalingError> {
        let raw = self.poll_http.get(url).send().await?.text().await?;

        let message = match SignalingMessage::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                // Protocol violation: this event is lost but the channel
                // keeps serving subsequent ones.
                tracing::warn!(error = %e, "unparseable long-poll event");
                return Ok(());
            }
        };

        if message.is_keepalive() {
            tracing::trace!("long-poll keep-alive");
            return Ok(());
        }

        tracing::debug!(
            event = %message.event_type,
            transaction = %message.transaction,
            "long-poll event"
        );
        self.buffer.push(message);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn correlation_buffer(&self) -> &Arc<CorrelationBuffer> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SignalingClient {
        SignalingClient::new("127.0.0.1", 1, "janus.plugin.videoroom").unwrap()
    }

    #[tokio::test]
    async fn test_requests_fail_fast_before_init() {
        let client = client();
        assert!(!client.is_ready());
        assert!(client.plugin_path().is_none());

        assert!(matches!(
            client.create_room().await,
            Err(SignalingError::NotReady)
        ));
        assert!(matches!(
            client.list_participants("1234").await,
            Err(SignalingError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_the_correlation_buffer() {
        let client = client();
        client.stop().await;

        assert!(matches!(
            client
                .correlation_buffer()
                .wait_for_transaction("tx", Duration::from_millis(10))
                .await,
            Err(CorrelationError::Closed)
        ));
        assert!(!client.is_ready());
    }
}
