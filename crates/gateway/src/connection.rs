//! Client connection engine
//!
//! Each accepted socket gets one Connection with two pumps: a read pump
//! that parses pipelined requests into the shared inbound queue, and a
//! write pump that drains the per-connection outbound queue strictly FIFO.
//! Neither pump ever has more than one I/O operation in flight, and a
//! failure on either side closes the connection without retrying.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::MessageQueue;
use crate::wire::{self, RequestEnvelope, ResponseEnvelope};

/// Stable numeric identity; queue entries carry this instead of a live
/// handle so the dispatch loop can tolerate "connection already gone".
pub type ConnectionId = u64;

/// One request handed off to the dispatch loop, tagged with the id of the
/// connection that produced it.
pub struct InboundRequest {
    pub connection_id: ConnectionId,
    pub request: RequestEnvelope,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Read buffer granularity.
const READ_CHUNK: usize = 8 * 1024;

pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,

    /// Outbound responses drained FIFO by the write pump.
    outbound: MessageQueue<ResponseEnvelope>,

    /// Latched close signal observed by both pumps.
    closing_tx: watch::Sender<bool>,

    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Take ownership of `stream` and start both pumps. Inbound requests
    /// land on `requests`.
    pub fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        requests: Arc<MessageQueue<InboundRequest>>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (closing_tx, closing_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id,
            state: AtomicU8::new(STATE_OPEN),
            outbound: MessageQueue::new(),
            closing_tx,
            pumps: Mutex::new(Vec::new()),
        });

        let reader = {
            let connection = connection.clone();
            let closing_rx = closing_rx.clone();
            tokio::spawn(async move {
                connection.read_pump(read_half, requests, closing_rx).await;
            })
        };
        let writer = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection.write_pump(write_half, closing_rx).await;
            })
        };
        *connection.pumps.lock() = vec![reader, writer];

        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// Queue a response; the write pump picks it up in arrival order. On a
    /// connection that is no longer open the response is dropped.
    pub fn send_response(&self, response: ResponseEnvelope) {
        if !self.is_connected() {
            tracing::debug!(connection_id = self.id, "response dropped, connection gone");
            return;
        }
        self.outbound.push(response);
    }

    /// Ask both pumps to stop. Idempotent; the socket halves are released
    /// when the pumps finish.
    pub fn disconnect(&self) {
        self.transition(STATE_CLOSING);
        let _ = self.closing_tx.send(true);
    }

    /// Wait for both pumps to finish. Used on server teardown.
    pub async fn join(&self) {
        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            let _ = pump.await;
        }
    }

    fn transition(&self, state: u8) {
        // Never move backwards (closed stays closed).
        self.state.fetch_max(state, Ordering::AcqRel);
    }

    /// Read loop: parse every complete pipelined request out of the
    /// buffer, push each to the shared queue, then issue the next read.
    async fn read_pump(
        &self,
        mut read_half: OwnedReadHalf,
        requests: Arc<MessageQueue<InboundRequest>>,
        mut closing_rx: watch::Receiver<bool>,
    ) {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);

        'outer: loop {
            loop {
                match wire::parse_request(&mut buffer) {
                    Ok(Some(request)) => {
                        requests.push(InboundRequest {
                            connection_id: self.id,
                            request,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(connection_id = self.id, error = %e, "bad request on wire");
                        break 'outer;
                    }
                }
            }

            let read = tokio::select! {
                read = read_half.read_buf(&mut buffer) => read,
                _ = closing_rx.changed() => break,
            };

            match read {
                Ok(0) => {
                    tracing::debug!(connection_id = self.id, "peer closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(connection_id = self.id, error = %e, "read failed");
                    break;
                }
            }
        }

        self.transition(STATE_CLOSED);
        let _ = self.closing_tx.send(true);
    }

    /// Write loop: drain the outbound queue in FIFO order, one write in
    /// flight at a time.
    async fn write_pump(
        &self,
        mut write_half: OwnedWriteHalf,
        mut closing_rx: watch::Receiver<bool>,
    ) {
        loop {
            while let Some(response) = self.outbound.pop_front() {
                let raw = wire::encode_response(&response);
                if let Err(e) = write_half.write_all(&raw).await {
                    tracing::debug!(connection_id = self.id, error = %e, "write failed");
                    self.transition(STATE_CLOSED);
                    return;
                }
            }

            if self.state.load(Ordering::Acquire) != STATE_OPEN {
                break;
            }

            tokio::select! {
                _ = self.outbound.wait() => {}
                _ = closing_rx.changed() => {}
            }
        }

        // Flush anything queued before the close was observed.
        while let Some(response) = self.outbound.pop_front() {
            let raw = wire::encode_response(&response);
            if write_half.write_all(&raw).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
        self.transition(STATE_CLOSED);
    }
}
