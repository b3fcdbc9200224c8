//! Local proxy front-end: SOCKS5 and HTTP CONNECT over one TCP port
//!
//! A capture adapter for hosts without a TUN stack. Each accepted client
//! negotiates its destination, gets a success reply, and is handed to the
//! pool as a proxy-protocol connection.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::capture::{EndpointId, LocalConn, ProxyTarget};
use crate::pool::TunnelPool;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_NO_ACCEPTABLE_METHOD: u8 = 0xff;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;
const SOCKS_REPLY_SUCCEEDED: u8 = 0x00;
const SOCKS_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS_REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Longest accepted HTTP CONNECT request head
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// A client must name its destination within this long
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted client stream, presented to the pool as a local connection
struct ProxiedStream {
    stream: TcpStream,
    id: EndpointId,
}

impl LocalConn for ProxiedStream {
    fn id(&self) -> EndpointId {
        self.id
    }
}

impl AsyncRead for ProxiedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxiedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

pub struct ProxyListener {
    listener: TcpListener,
    pool: Arc<TunnelPool>,
}

impl ProxyListener {
    pub async fn bind(addr: SocketAddr, pool: Arc<TunnelPool>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the listener fails
    pub async fn run(self) -> Result<()> {
        tracing::info!("Proxy listener on {} (SOCKS5, HTTP CONNECT)", self.local_addr()?);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let pool = self.pool.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, peer_addr, pool).await {
                    tracing::warn!("Proxy client {} failed: {:#}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_client(mut stream: TcpStream, peer_addr: SocketAddr, pool: Arc<TunnelPool>) -> Result<()> {
    let local_addr = stream.local_addr()?;

    let Some(target) = negotiate(&mut stream, HANDSHAKE_TIMEOUT).await? else {
        return Ok(());
    };
    tracing::debug!("Proxy client {} requested {}", peer_addr, target);

    let conn = ProxiedStream {
        stream,
        id: EndpointId::new(local_addr, peer_addr),
    };
    pool.handle_http_socks5_tcp(Box::new(conn), &target).await?;
    Ok(())
}

/// Run the SOCKS5 or HTTP CONNECT handshake, whichever the first byte asks for
///
/// `None` when the client hangs up before sending anything.
async fn negotiate(stream: &mut TcpStream, deadline: Duration) -> Result<Option<ProxyTarget>> {
    let handshake = async {
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Ok(None);
        }

        let target = if first[0] == SOCKS_VERSION {
            socks5_handshake(stream).await?
        } else {
            http_connect_handshake(stream).await?
        };
        Ok::<_, anyhow::Error>(Some(target))
    };

    tokio::time::timeout(deadline, handshake)
        .await
        .with_context(|| format!("Handshake not completed within {:?}", deadline))?
}

/// Negotiate a no-auth SOCKS5 CONNECT and reply success
pub(crate) async fn socks5_handshake<S>(stream: &mut S) -> Result<ProxyTarget>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        bail!("Unsupported SOCKS version {}", version);
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, SOCKS_NO_ACCEPTABLE_METHOD])
            .await?;
        bail!("SOCKS client offers no acceptable auth method");
    }
    stream.write_all(&[SOCKS_VERSION, SOCKS_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [_, command, _, atyp] = head;

    if command != SOCKS_CMD_CONNECT {
        socks5_reply(stream, SOCKS_REPLY_COMMAND_NOT_SUPPORTED).await?;
        bail!("Unsupported SOCKS command {}", command);
    }

    let host = match atyp {
        SOCKS_ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        SOCKS_ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        SOCKS_ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).context("SOCKS domain is not UTF-8")?
        }
        other => {
            socks5_reply(stream, SOCKS_REPLY_ADDRESS_NOT_SUPPORTED).await?;
            bail!("Unsupported SOCKS address type {}", other);
        }
    };
    let port = stream.read_u16().await?;

    socks5_reply(stream, SOCKS_REPLY_SUCCEEDED).await?;
    Ok(ProxyTarget::new(host, port))
}

async fn socks5_reply<S>(stream: &mut S, reply: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Bound address is not meaningful here; always 0.0.0.0:0
    stream
        .write_all(&[SOCKS_VERSION, reply, 0x00, SOCKS_ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Read a `CONNECT host:port` request head and reply 200
pub(crate) async fn http_connect_handshake<S>(stream: &mut S) -> Result<ProxyTarget>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Byte at a time so nothing past the head is consumed
    let mut head = Vec::with_capacity(512);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            stream
                .write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n")
                .await?;
            bail!("HTTP request head too large");
        }
        head.push(stream.read_u8().await?);
    }

    let head = String::from_utf8_lossy(&head);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let authority = parts.next().unwrap_or_default();

    if !method.eq_ignore_ascii_case("CONNECT") {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\n\r\n")
            .await?;
        bail!("Unsupported HTTP proxy method {}", method);
    }

    let target = match parse_authority(authority) {
        Some(target) => target,
        None => {
            stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            bail!("Invalid CONNECT authority {}", authority);
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    Ok(target)
}

fn parse_authority(authority: &str) -> Option<ProxyTarget> {
    let (host, port) = authority.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some(ProxyTarget::new(host, port))
}
