//! In-memory stand-in for a connection delivered by the capture adapter

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

use lproxy::{EndpointId, LocalConn};

/// Source ports handed out to mock applications
static NEXT_APP_PORT: AtomicU16 = AtomicU16::new(40000);

/// The proxy-facing half, handed to the pool
pub struct MockConn {
    io: DuplexStream,
    id: EndpointId,
    shutdowns: Arc<AtomicUsize>,
}

/// The application-facing half, kept by the test
pub struct MockPeer {
    pub io: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
}

impl MockConn {
    /// A connection from a mock application to `destination`
    pub fn pair(destination: SocketAddr) -> (Self, MockPeer) {
        let port = NEXT_APP_PORT.fetch_add(1, Ordering::Relaxed);
        let app_addr = SocketAddr::from(([10, 0, 0, 2], port));
        let (io, peer_io) = tokio::io::duplex(64 * 1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));

        let conn = Self {
            io,
            id: EndpointId::new(destination, app_addr),
            shutdowns: shutdowns.clone(),
        };
        let peer = MockPeer {
            io: peer_io,
            shutdowns,
        };
        (conn, peer)
    }
}

impl LocalConn for MockConn {
    fn id(&self) -> EndpointId {
        self.id
    }
}

impl AsyncRead for MockConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.io).poll_shutdown(cx);
        if result.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

impl MockPeer {
    /// Times the proxy side closed the connection
    pub fn close_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Read whatever arrives within `timeout`; empty on EOF
    pub async fn read_some(&mut self, timeout: Duration) -> Result<Vec<u8>, String> {
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(timeout, self.io.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(format!("Read error: {}", e)),
            Err(_) => Err("Read timeout".to_string()),
        }
    }

    /// Read until `expected` bytes arrived or EOF
    pub async fn read_exactly(&mut self, expected: usize, timeout: Duration) -> Result<Vec<u8>, String> {
        let mut data = Vec::with_capacity(expected);
        while data.len() < expected {
            let chunk = self.read_some(timeout).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}
