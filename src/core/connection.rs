/// Backend connections to cluster nodes
///
/// A `BackendConnection` is one TCP stream speaking RESP to one node. It is
/// strictly request/response: the caller writes a whole frame, then reads
/// until the reply decoder reports completion, before anything else is sent.
use crate::core::ClusterNode;
use crate::error::{GatewayError, GatewayResult};
use crate::redis::resp::{Emit, FeedStatus, ReplyDecoder, RespError};
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A protocol-speaking channel to one cluster node
#[derive(Debug)]
pub struct BackendConnection {
    id: u64,
    node: Arc<ClusterNode>,
    stream: TcpStream,
    read_buf: BytesMut,
    buffer_size: usize,
    created_at: Instant,
    last_used: Instant,
}

impl BackendConnection {
    fn new(node: Arc<ClusterNode>, stream: TcpStream, buffer_size: usize) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            node,
            stream,
            read_buf: BytesMut::with_capacity(buffer_size),
            buffer_size,
            created_at: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time spent idle since the last completed exchange
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Record that an exchange finished cleanly
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Write a whole frame and flush it, bounded by `send_timeout`
    pub async fn send(&mut self, frame: &[u8], send_timeout: Duration) -> GatewayResult<()> {
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        let result = timeout(send_timeout, write).await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Network(e)),
            Err(_) => Err(GatewayError::SendTimeout {
                node: self.node.addr.clone(),
            }),
        }
    }

    /// Read the next chunk from the node, bounded by `read_timeout`.
    ///
    /// Returns the bytes received; EOF is an error because a reply is
    /// always outstanding when this is called.
    pub async fn recv(&mut self, read_timeout: Duration) -> GatewayResult<BytesMut> {
        self.read_buf.reserve(self.buffer_size);

        let result = timeout(read_timeout, self.stream.read_buf(&mut self.read_buf)).await;

        match result {
            Ok(Ok(0)) => Err(GatewayError::Network(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection mid-reply", self.node.addr),
            ))),
            Ok(Ok(_)) => Ok(self.read_buf.split()),
            Ok(Err(e)) => Err(GatewayError::Network(e)),
            Err(_) => Err(GatewayError::ReceiveTimeout {
                node: self.node.addr.clone(),
            }),
        }
    }

    /// Send one command and read its whole reply into memory.
    ///
    /// For small control replies (PING, CLUSTER NODES); request traffic goes
    /// through the streaming path instead.
    pub async fn round_trip(
        &mut self,
        frame: &[u8],
        send_timeout: Duration,
        read_timeout: Duration,
    ) -> GatewayResult<(FeedStatus, Bytes)> {
        self.send(frame, send_timeout).await?;

        let mut decoder = ReplyDecoder::new();
        let mut body = BytesMut::new();
        loop {
            let chunk = self.recv(read_timeout).await?.freeze();
            let feed = decoder.feed(&chunk)?;
            for item in feed.emitted {
                if let Emit::Body(bytes) = item {
                    body.extend_from_slice(&bytes);
                }
            }
            if feed.status != FeedStatus::NeedMore {
                if feed.consumed != chunk.len() {
                    return Err(RespError::TrailingData(chunk.len() - feed.consumed).into());
                }
                self.touch();
                return Ok((feed.status, body.freeze()));
            }
        }
    }
}

/// Opens backend connections with a bounded connect phase
#[derive(Debug, Clone)]
pub struct Connector {
    connect_timeout: Duration,
    buffer_size: usize,
}

impl Connector {
    pub fn new(connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            connect_timeout,
            buffer_size,
        }
    }

    /// Connect to a cluster node.
    ///
    /// A refused or failed connect marks the node unreachable; a success
    /// marks it available again.
    pub async fn connect(&self, node: &Arc<ClusterNode>) -> GatewayResult<BackendConnection> {
        debug!(node = %node.addr, "Connecting to backend");

        match timeout(self.connect_timeout, TcpStream::connect(node.addr.as_str())).await {
            Ok(Ok(stream)) => {
                if let Err(e) = Self::configure_backend_stream(&stream) {
                    warn!(node = %node.addr, "Failed to configure backend stream: {}", e);
                }
                if node.mark_healthy() {
                    debug!(node = %node.addr, "Backend reachable again");
                }
                Ok(BackendConnection::new(
                    Arc::clone(node),
                    stream,
                    self.buffer_size,
                ))
            }
            Ok(Err(e)) => {
                if node.mark_unreachable() {
                    warn!(node = %node.addr, "Backend marked unreachable: {}", e);
                }
                Err(GatewayError::unreachable(node.addr.clone(), e))
            }
            Err(_) => {
                node.mark_unreachable();
                Err(GatewayError::ConnectTimeout {
                    node: node.addr.clone(),
                })
            }
        }
    }

    /// Configure backend stream for low latency and dead-peer detection
    fn configure_backend_stream(stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn node(addr: &str) -> Arc<ClusterNode> {
        Arc::new(ClusterNode::new(0, addr.to_string()))
    }

    #[tokio::test]
    async fn test_connect_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            stream.write_all(b"+PONG\r\n").await.unwrap();
        });

        let connector = Connector::default();
        let mut conn = connector.connect(&node(&addr.to_string())).await.unwrap();
        conn.send(b"*1\r\n$4\r\nPING\r\n", Duration::from_secs(1))
            .await
            .unwrap();
        let reply = conn.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&reply[..], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_round_trip_across_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"$11\r\nhello").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b" world\r\n").await.unwrap();
        });

        let mut conn = Connector::default()
            .connect(&node(&addr.to_string()))
            .await
            .unwrap();
        let (status, body) = conn
            .round_trip(
                b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(status, FeedStatus::Complete);
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let connector = Connector::default();
        let target = node(&addr.to_string());
        let a = connector.connect(&target).await.unwrap();
        let b = connector.connect(&target).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_connect_refused_marks_unreachable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = node(&addr.to_string());
        let result = Connector::default().connect(&target).await;

        assert!(matches!(
            result,
            Err(GatewayError::BackendUnreachable { .. })
        ));
        assert!(!target.is_healthy());
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let mut conn = Connector::default()
            .connect(&node(&addr.to_string()))
            .await
            .unwrap();
        let result = conn.recv(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(GatewayError::ReceiveTimeout { .. })));
    }

    #[tokio::test]
    async fn test_eof_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = Connector::default()
            .connect(&node(&addr.to_string()))
            .await
            .unwrap();
        let result = conn.recv(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GatewayError::Network(_))));
    }
}
