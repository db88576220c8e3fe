//! TCP server: accept loop, connection arena and dispatch loop
//!
//! The server owns every live Connection in an arena keyed by numeric id.
//! One dispatch loop drains the shared inbound queue and spawns a handler
//! task per request; responses are resolved back to their connection by
//! id, which may legitimately be gone by then.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionId, InboundRequest};
use crate::queue::MessageQueue;
use crate::router::Router;

/// Connection ids start well clear of zero so they stand out in logs.
const FIRST_CONNECTION_ID: u64 = 10_000;

pub struct GatewayServer {
    requests: Arc<MessageQueue<InboundRequest>>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayServer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            requests: Arc::new(MessageQueue::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(FIRST_CONNECTION_ID),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Bind `addr` and start the accept and dispatch loops. Returns the
    /// bound address, which matters when the port was 0.
    pub async fn start(
        self: Arc<Self>,
        addr: &str,
        router: Arc<Router>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "server listening");

        let acceptor = {
            let server = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                server.accept_loop(listener, shutdown_rx).await;
            })
        };
        let dispatcher = {
            let server = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                server.dispatch_loop(router, shutdown_rx).await;
            })
        };
        self.loops.lock().extend([acceptor, dispatcher]);

        Ok(local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Stop accepting and dispatching, then close every live connection.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let loops = std::mem::take(&mut *self.loops.lock());
        for task in loops {
            let _ = task.await;
        }

        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.disconnect();
        }
        for connection in &connections {
            connection.join().await;
        }
        tracing::info!("server stopped");
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(connection_id = id, %peer, "connection accepted");
                            let connection = Connection::spawn(id, stream, self.requests.clone());
                            self.connections.lock().insert(id, connection);
                            self.sweep_dead();
                        }
                        Err(e) => {
                            // Transient accept errors (EMFILE and friends)
                            // must not kill the loop.
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    /// Drain the shared queue; each request gets its own handler task so a
    /// slow signaling exchange never blocks dispatch.
    async fn dispatch_loop(
        self: Arc<Self>,
        router: Arc<Router>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = self.requests.wait() => {}
                _ = shutdown_rx.changed() => break,
            }

            while let Some(inbound) = self.requests.pop_front() {
                let server = self.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let response = router.handle(inbound.request).await;
                    server.deliver(inbound.connection_id, response);
                });
            }
        }
    }

    /// Resolve a connection id back to a live connection. A handler racing
    /// a disconnect is expected; the response is dropped quietly.
    fn deliver(&self, connection_id: ConnectionId, response: crate::wire::ResponseEnvelope) {
        let connection = self.connections.lock().get(&connection_id).cloned();
        match connection {
            Some(connection) => connection.send_response(response),
            None => {
                tracing::debug!(connection_id, "response dropped, connection already gone");
            }
        }
    }

    fn sweep_dead(&self) {
        self.connections
            .lock()
            .retain(|_, connection| connection.is_connected());
    }
}

impl Default for GatewayServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash256;
    use crate::session::SessionTable;
    use crate::signaling::SignalingClient;
    use crate::users::{ConfigUserRepository, User, UserService};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_router() -> Arc<Router> {
        let sessions = Arc::new(SessionTable::new(10));
        let signaling =
            Arc::new(SignalingClient::new("127.0.0.1", 1, "janus.plugin.videoroom").unwrap());
        let users = UserService::new(Box::new(ConfigUserRepository::new(vec![User::new(
            1,
            "alice",
            &hash256("hunter2"),
        )
        .unwrap()])));
        Arc::new(Router::new(sessions, signaling, users))
    }

    async fn started_server() -> (Arc<GatewayServer>, SocketAddr) {
        let server = Arc::new(GatewayServer::new());
        let addr = server
            .clone()
            .start("127.0.0.1:0", test_router())
            .await
            .unwrap();
        (server, addr)
    }

    async fn read_response(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            raw.extend_from_slice(&chunk[..n]);
            if n == 0 || raw.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8(raw).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_login_over_tcp() {
        let (server, addr) = started_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let body = r#"{"username":"alice","password":"hunter2"}"#;
        let request = format!(
            "POST /api/login HTTP/1.1\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_path_gets_404_over_tcp() {
        let (server, addr) = started_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /nothing/here HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_live_connections() {
        let (server, addr) = started_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Let the accept loop register the connection.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 1);

        server.stop().await;

        // Peer observes EOF once the pumps shut the socket down.
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_connections() {
        let (server, addr) = started_server().await;

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let ids: Vec<ConnectionId> = server.connections.lock().keys().copied().collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| *id >= FIRST_CONNECTION_ID));

        server.stop().await;
    }
}
