//! Socket transport — length-prefixed framing, the id handshake, and
//! the pipe wiring for TCP connections.
//!
//! Every frame on a socket is a 4-byte big-endian length followed by
//! exactly that many bytes. The first frame a connecting side sends
//! carries its raw PeerId string; everything after that is compressed,
//! encoded pipe traffic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ExchangeError;
use crate::identity::PeerId;
use crate::pipe::{PayloadSink, Pipe};
use crate::transport::Neighbor;

/// Upper bound on a single frame; anything larger is treated as a
/// protocol violation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), ExchangeError> {
    if bytes.is_empty() {
        return Err(ExchangeError::Transport("cannot send an empty frame".to_string()));
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(ExchangeError::Transport(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Fails on EOF, short reads, and
/// oversized length prefixes.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ExchangeError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ExchangeError::Transport(format!(
            "peer announced a frame of {len} bytes, over the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Send the own id as the opening frame of a fresh connection.
pub async fn send_own_id<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: &PeerId,
) -> Result<(), ExchangeError> {
    write_frame(writer, id.as_str().as_bytes()).await
}

/// Read and validate the peer's opening id frame.
pub async fn read_peer_id<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerId, ExchangeError> {
    let bytes = read_frame(reader).await?;
    let raw = String::from_utf8(bytes)
        .map_err(|_| ExchangeError::InvalidPeerId("id is not valid UTF-8".to_string()))?;
    PeerId::new(&raw)
}

/// [`PayloadSink`] writing framed payloads to a socket. The mutex keeps
/// writes whole; frames from concurrent senders never interleave.
pub struct SocketSink {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl SocketSink {
    pub fn new(writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
        })
    }
}

#[async_trait]
impl PayloadSink for SocketSink {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ExchangeError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await
    }

    async fn disconnect(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("socket shutdown failed: {e}");
        }
    }
}

/// Build a pipe over an already-handshaken socket and spawn its read
/// loop. The pipe closes when the socket dies, and the read loop ends
/// when the pipe closes.
pub fn spawn_socket_pipe(own_id: PeerId, neighbor_id: PeerId, stream: TcpStream) -> Arc<Pipe> {
    let endpoint = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "socket".to_string());
    let (read_half, write_half) = stream.into_split();
    let neighbor = Neighbor::new(neighbor_id, endpoint);
    let pipe = Pipe::new(own_id, neighbor, SocketSink::new(write_half));

    tokio::spawn(read_loop(pipe.clone(), read_half));
    pipe
}

async fn read_loop(pipe: Arc<Pipe>, mut reader: OwnedReadHalf) {
    loop {
        if pipe.is_closed() {
            break;
        }
        match read_frame(&mut reader).await {
            Ok(bytes) => pipe.handle_incoming(&bytes).await,
            Err(e) => {
                debug!(neighbor = %pipe.neighbor(), "socket read ended: {e}");
                pipe.close().await;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentMessage, Message, Priority};
    use crate::pipe::{DeliveryResult, PipeObserver};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello frame").await.unwrap();
        write_frame(&mut client, &[0u8; 3]).await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"hello frame");
        assert_eq!(read_frame(&mut server).await.unwrap(), vec![0u8; 3]);
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);
        assert!(write_frame(&mut client, b"").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&huge).await.unwrap();
        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(ExchangeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_fails() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(b"shor").await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(ExchangeError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_id_handshake_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let id = PeerId::new("device1111").unwrap();
        send_own_id(&mut client, &id).await.unwrap();
        assert_eq!(read_peer_id(&mut server).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_malformed_id_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"not-alphanumeric!").await.unwrap();
        assert!(matches!(
            read_peer_id(&mut server).await,
            Err(ExchangeError::InvalidPeerId(_))
        ));
    }

    struct Collector {
        received: Mutex<Vec<Message>>,
        completions: Mutex<usize>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                completions: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl PipeObserver for Collector {
        async fn on_message_received(&self, message: Message) {
            self.received.lock().unwrap().push(message);
        }

        async fn on_delivery_result(&self, _message: Message, _result: DeliveryResult) {}

        async fn on_pipe_broken(&self) {}

        async fn on_pipe_completed(&self) {
            *self.completions.lock().unwrap() += 1;
        }
    }

    fn sample() -> Message {
        Message::Content(ContentMessage {
            id: "m1".to_string(),
            from_id: PeerId::new("device1111").unwrap(),
            to_id: PeerId::new("device2222").unwrap(),
            service_id: 1,
            timestamp: 1_700_000_000_000,
            ttl_hours: 1,
            priority: Priority::High,
            body: b"over the wire".to_vec(),
        })
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_socket_pipes_carry_messages_both_ways() {
        let (client, server) = connected_pair().await;
        let a = PeerId::new("device1111").unwrap();
        let b = PeerId::new("device2222").unwrap();
        let pipe_a = spawn_socket_pipe(a.clone(), b.clone(), client);
        let pipe_b = spawn_socket_pipe(b, a, server);

        let obs_a = Collector::new();
        let obs_b = Collector::new();
        pipe_a.set_observer(obs_a.clone()).await.unwrap();
        pipe_b.set_observer(obs_b.clone()).await.unwrap();

        pipe_a.push(sample()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(obs_b.received.lock().unwrap().len(), 1);
        assert_eq!(obs_b.received.lock().unwrap()[0], sample());

        // Mutual done closes both ends.
        pipe_a.signal_done().await.unwrap();
        pipe_b.signal_done().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pipe_a.is_closed());
        assert!(pipe_b.is_closed());
    }

    #[tokio::test]
    async fn test_peer_vanishing_closes_pipe() {
        let (client, server) = connected_pair().await;
        let a = PeerId::new("aaa").unwrap();
        let b = PeerId::new("bbb").unwrap();
        let pipe = spawn_socket_pipe(a, b, server);
        pipe.set_observer(Collector::new()).await.unwrap();

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pipe.is_closed());
    }
}
