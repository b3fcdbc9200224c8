//! Socket protection for sockets that must bypass the local capture interface
//!
//! On Android-style VPN setups every socket the proxy itself opens (gateway
//! sessions, control-plane DNS) has to be exempted from the VPN route, or its
//! traffic is captured again and loops. The platform hands us a callback that
//! does this for a raw descriptor; it must run before the socket sends anything.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::TunnelError;

/// Callback exempting a raw socket descriptor from interception
#[derive(Clone)]
pub struct SocketProtector {
    inner: Arc<dyn Fn(u64) + Send + Sync>,
}

impl SocketProtector {
    pub fn new<F>(protect: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(protect),
        }
    }

    /// Invoke the callback on a raw descriptor
    pub fn protect_raw(&self, raw: u64) {
        (self.inner)(raw)
    }

    #[cfg(unix)]
    pub fn protect<S: std::os::unix::io::AsRawFd>(&self, socket: &S) {
        let fd = socket.as_raw_fd();
        tracing::debug!("Protecting socket fd={}", fd);
        self.protect_raw(fd as u64);
    }

    #[cfg(windows)]
    pub fn protect<S: std::os::windows::io::AsRawSocket>(&self, socket: &S) {
        let raw = socket.as_raw_socket();
        tracing::debug!("Protecting socket {}", raw);
        self.protect_raw(raw);
    }
}

impl fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketProtector").finish_non_exhaustive()
    }
}

/// Open a TCP connection whose socket is protected before connecting
pub async fn connect_tcp(
    addr: SocketAddr,
    protector: Option<&SocketProtector>,
    timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(protector) = protector {
        protector.protect(&socket);
    }

    match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay on {} failed: {}", addr, e);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TunnelError::ConnectTimeout(addr)),
    }
}

/// Bind a UDP socket connected to `peer`, protected before any datagram is sent
pub async fn bind_udp(
    peer: SocketAddr,
    protector: Option<&SocketProtector>,
) -> Result<UdpSocket, TunnelError> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let std_socket = std::net::UdpSocket::bind(local)?;
    if let Some(protector) = protector {
        protector.protect(&std_socket);
    }
    std_socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(std_socket)?;
    socket.connect(peer).await?;
    Ok(socket)
}
