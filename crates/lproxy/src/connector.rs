use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::{Host, Url};

use lproxy_common::{protect, SocketProtector};

use crate::resolver::ProtectedResolver;

/// WebSocket session to the gateway
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for resolve + connect + handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host part of a URL without IPv6 brackets
pub fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(IpAddr::V4(ip).to_string()),
        Host::Ipv6(ip) => Some(IpAddr::V6(ip).to_string()),
    }
}

/// Establishes gateway sessions for one tunnel
///
/// The gateway host goes through the protected resolver and the TCP socket is
/// protected before connecting, so neither the lookup nor the session itself
/// is captured by the local interface.
pub struct SessionDialer {
    url: Url,
    resolver: Arc<ProtectedResolver>,
    protector: Option<SocketProtector>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl SessionDialer {
    pub fn new(
        url: Url,
        resolver: Arc<ProtectedResolver>,
        protector: Option<SocketProtector>,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            url,
            resolver,
            protector,
            tls,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open a new session, bounded by [`CONNECT_TIMEOUT`]
    pub async fn dial(&self) -> Result<WsStream> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.dial_inner())
            .await
            .map_err(|_| anyhow::anyhow!("Connecting to {} timed out", self.url))?
    }

    async fn dial_inner(&self) -> Result<WsStream> {
        let host = url_host(&self.url).context("Gateway URL has no host")?;
        let port = self
            .url
            .port_or_known_default()
            .context("Gateway URL has no port")?;

        let ip = self
            .resolver
            .get_host_ip(&host)
            .await
            .with_context(|| format!("Failed to resolve gateway host {}", host))?;
        let addr = SocketAddr::new(ip, port);

        let stream = protect::connect_tcp(addr, self.protector.as_ref(), CONNECT_TIMEOUT)
            .await
            .with_context(|| format!("TCP connect to {} failed", addr))?;

        let connector = self.tls.clone().map(Connector::Rustls);
        let (ws_stream, response) = tokio_tungstenite::client_async_tls_with_config(
            self.url.as_str(),
            stream,
            None,
            connector,
        )
        .await
        .with_context(|| format!("WebSocket handshake with {} failed", self.url))?;

        tracing::debug!(
            "WebSocket session to {} ({}) established, status {}",
            self.url,
            addr,
            response.status()
        );
        Ok(ws_stream)
    }
}
