//! Rendezvous over TCP — a reachable exchange point for devices that are
//! never in radio range of each other.
//!
//! The server accepts connections, reads the opening id frame, and runs a
//! normal router session over a socket pipe; it is just another peer that
//! happens to be always on. The client side is a periodic link that dials
//! the server, skips rounds while a previous exchange is still busy, and
//! recycles sockets that have gone idle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ExchangeContext;
use crate::error::ExchangeError;
use crate::identity::PeerId;
use crate::pipe::Pipe;
use crate::socket::{read_peer_id, send_own_id, spawn_socket_pipe};

/// Always-on exchange peer listening on a TCP port.
pub struct RendezvousServer {
    ctx: Arc<ExchangeContext>,
    listener: TcpListener,
}

impl RendezvousServer {
    pub async fn bind(ctx: Arc<ExchangeContext>, addr: &str) -> Result<Self, ExchangeError> {
        let listener = TcpListener::bind(addr).await?;
        info!(own = %ctx.own_id, addr = %listener.local_addr()?, "rendezvous server listening");
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ExchangeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails. Each connection gets
    /// its own task; a bad handshake only costs that connection.
    pub async fn run(&self) -> Result<(), ExchangeError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!(%addr, "incoming connection");
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(ctx, stream).await {
                    warn!(%addr, "connection rejected: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    ctx: Arc<ExchangeContext>,
    mut stream: TcpStream,
) -> Result<(), ExchangeError> {
    let peer_id = read_peer_id(&mut stream).await?;
    info!(peer = %peer_id, "peer connected");
    let pipe = spawn_socket_pipe(ctx.own_id.clone(), peer_id, stream);
    ctx.chooser().start_session(ctx.own_id.clone(), pipe);
    Ok(())
}

/// Periodic client of a [`RendezvousServer`].
pub struct ServerLink {
    ctx: Arc<ExchangeContext>,
    server_id: PeerId,
    last_pipe: Mutex<Option<Arc<Pipe>>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl ServerLink {
    pub fn new(ctx: Arc<ExchangeContext>) -> Result<Arc<Self>, ExchangeError> {
        let server_id = PeerId::new(&ctx.config.server_id)?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            ctx,
            server_id,
            last_pipe: Mutex::new(None),
            shutdown,
            running: AtomicBool::new(false),
        }))
    }

    /// Arm the periodic timer; the first exchange runs immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(link.ctx.config.server_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => link.run_exchange().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Stop scheduling exchanges and drop the current socket. An
    /// exchange already in flight is not interrupted beyond that.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        let last = self.last_pipe.lock().expect("link lock poisoned").take();
        if let Some(pipe) = last {
            pipe.close().await;
        }
    }

    async fn run_exchange(&self) {
        // Recycle a socket nothing has moved on for a full interval;
        // otherwise let the running exchange finish and skip this round.
        let last = self.last_pipe.lock().expect("link lock poisoned").clone();
        if let Some(pipe) = last {
            if !pipe.is_closed() {
                let idle = chrono::Utc::now().timestamp_millis() - pipe.last_interaction_ms();
                if idle < self.ctx.config.server_interval.as_millis() as i64 {
                    debug!("previous exchange still in flight, skipping this round");
                    return;
                }
                info!(server = %self.server_id, "closing stale server socket");
                pipe.close().await;
            }
        }

        let addr = &self.ctx.config.server_addr;
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%addr, "server not reachable: {e}");
                return;
            }
        };
        // The device id is the first thing on a fresh connection.
        if let Err(e) = send_own_id(&mut stream, &self.ctx.own_id).await {
            warn!(%addr, "id handshake failed: {e}");
            return;
        }
        let pipe = spawn_socket_pipe(self.ctx.own_id.clone(), self.server_id.clone(), stream);
        *self.last_pipe.lock().expect("link lock poisoned") = Some(pipe.clone());
        self.ctx.chooser().start_session(self.ctx.own_id.clone(), pipe);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeConfig, RouterKind};
    use crate::message::{ContentMessage, Priority};
    use crate::socket::write_frame;
    use crate::store::{MemoryAckStore, MemoryMessageStore, MessageStore};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Node {
        ctx: Arc<ExchangeContext>,
        messages: Arc<MemoryMessageStore>,
        acks: Arc<MemoryAckStore>,
    }

    fn node(id: &str, config: ExchangeConfig) -> Node {
        let messages = Arc::new(MemoryMessageStore::new());
        let acks = Arc::new(MemoryAckStore::new());
        let ctx = ExchangeContext::new(
            PeerId::new(id).unwrap(),
            config,
            messages.clone(),
            acks.clone(),
        );
        Node {
            ctx,
            messages,
            acks,
        }
    }

    fn msg(id: &str, from: &str, to: &str) -> ContentMessage {
        ContentMessage {
            id: id.to_string(),
            from_id: PeerId::new(from).unwrap(),
            to_id: PeerId::new(to).unwrap(),
            service_id: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ttl_hours: 24,
            priority: Priority::Low,
            body: id.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_client_and_server_exchange_over_tcp() {
        let server_config = ExchangeConfig {
            router: RouterKind::Acknowledging,
            ..ExchangeConfig::default()
        };
        let server_node = node("rendezvous", server_config);
        server_node
            .messages
            .add(msg("fromserver", "rendezvous", "device1111"))
            .await;
        let server = RendezvousServer::bind(server_node.ctx.clone(), "127.0.0.1:0")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let client_config = ExchangeConfig {
            router: RouterKind::Acknowledging,
            server_addr: addr.to_string(),
            server_interval: Duration::from_secs(30),
            ..ExchangeConfig::default()
        };
        let client_node = node("device1111", client_config);
        client_node
            .messages
            .add(msg("fromclient", "device1111", "device9999"))
            .await;

        let link = ServerLink::new(client_node.ctx.clone()).unwrap();
        link.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The relayed message reached the server; the client got the
        // server's message (it was the destination, so it also acked it).
        assert!(server_node.messages.contains("fromclient"));
        assert!(
            client_node.messages.contains("fromserver")
                || client_node.acks.contains("fromserver")
        );
        assert!(client_node.acks.contains("fromserver"));

        link.stop().await;
        server_task.abort();
    }

    #[tokio::test]
    async fn test_server_drops_connection_on_bad_id() {
        let server_node = node("rendezvous", ExchangeConfig::default());
        let server = RendezvousServer::bind(server_node.ctx.clone(), "127.0.0.1:0")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, b"id with spaces").await.unwrap();

        // The server rejects the handshake without sending anything.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        server_task.abort();
    }

    #[tokio::test]
    async fn test_link_survives_unreachable_server() {
        // No server listening: the link must cope and keep no pipe.
        let config = ExchangeConfig {
            server_addr: "127.0.0.1:1".to_string(),
            server_interval: Duration::from_millis(50),
            ..ExchangeConfig::default()
        };
        let client = node("device1111", config);
        let link = ServerLink::new(client.ctx.clone()).unwrap();
        link.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(link.last_pipe.lock().unwrap().is_none());
        link.stop().await;
    }

    #[tokio::test]
    async fn test_link_start_is_idempotent() {
        let client = node("device1111", ExchangeConfig::default());
        let link = ServerLink::new(client.ctx.clone()).unwrap();
        link.start();
        link.start();
        link.stop().await;
    }
}
