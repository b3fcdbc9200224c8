//! Contract with the local capture adapter
//!
//! The adapter (a user-space TCP/IP stack behind a TUN device, or the local
//! proxy listener) reconstructs connections and hands them over as byte
//! streams. UDP handles are expected to keep datagram boundaries: every read
//! yields exactly one datagram and every write sends exactly one.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use lproxy_protocol::TargetAddr;

/// Four-tuple of a captured connection, named from the stack's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    /// Address the application tried to reach (the proxied destination)
    pub local_addr: SocketAddr,
    /// Address of the application that opened the connection
    pub remote_addr: SocketAddr,
}

impl EndpointId {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote_addr, self.local_addr)
    }
}

/// A connection handle delivered by the capture adapter
///
/// Closing is `AsyncWriteExt::shutdown` followed by drop; the manager and the
/// tunnel take handles by value so a handle is closed at most once.
pub trait LocalConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn id(&self) -> EndpointId;
}

pub type BoxedConn = Box<dyn LocalConn>;

/// Destination requested through HTTP CONNECT or SOCKS5
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Domain name or literal IP address
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Wire target, leaving domain names for the gateway to resolve
    pub fn to_target_addr(&self) -> TargetAddr {
        TargetAddr::from_host_port(&self.host, self.port)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Close a local connection, logging instead of failing
pub async fn close_local(mut conn: BoxedConn) {
    let id = conn.id();
    if let Err(e) = conn.shutdown().await {
        tracing::debug!("Closing local connection {} failed: {}", id, e);
    }
}
