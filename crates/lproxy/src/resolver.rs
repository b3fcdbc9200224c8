//! Control-plane resolver for the gateway host
//!
//! Resolves exactly one configured host, once, with a raw A query sent over a
//! protected UDP socket. System resolution is avoided on purpose: with a
//! system-wide capture in place it would be routed back into the proxy.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use thiserror::Error;
use tokio::sync::Mutex;

use lproxy_common::{protect, SocketProtector, TunnelError};

/// Deadline for one DNS round trip
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer for a reply, one datagram
const MAX_REPLY_SIZE: usize = 1500;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("host not match, expected: {expected}, input: {input}")]
    HostMismatch { expected: String, input: String },

    #[error("no A record found in DNS reply for {0}")]
    NoAddressRecord(String),

    #[error("DNS query to {0} timed out")]
    Timeout(SocketAddr),

    #[error("udp send to dns server length not match: {sent} != {expected}")]
    ShortWrite { sent: usize, expected: usize },

    #[error("DNS reply id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Socket setup failed: {0}")]
    Socket(#[from] TunnelError),
}

/// Resolver for the single control-plane host
///
/// The first successful answer is kept for the lifetime of the resolver;
/// there is no TTL handling, a changed gateway address needs a restart.
pub struct ProtectedResolver {
    host: String,
    dns_server: SocketAddr,
    protector: Option<SocketProtector>,
    timeout: Duration,
    resolved: Mutex<Option<IpAddr>>,
}

impl ProtectedResolver {
    pub fn new(
        host: impl Into<String>,
        dns_server: SocketAddr,
        protector: Option<SocketProtector>,
    ) -> Self {
        Self {
            host: host.into(),
            dns_server,
            protector,
            timeout: DNS_QUERY_TIMEOUT,
            resolved: Mutex::new(None),
        }
    }

    /// Override the round-trip deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The only host this resolver answers for
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn dns_server(&self) -> SocketAddr {
        self.dns_server
    }

    /// Cached address, if already resolved and not currently being resolved
    pub fn cached(&self) -> Option<IpAddr> {
        self.resolved.try_lock().ok().and_then(|guard| *guard)
    }

    /// Resolve the configured host
    ///
    /// Concurrent callers are serialized on the cache lock, so at most one
    /// query is in flight and every caller sees the same address.
    pub async fn get_host_ip(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if host != self.host {
            return Err(ResolveError::HostMismatch {
                expected: self.host.clone(),
                input: host.to_string(),
            });
        }

        let mut resolved = self.resolved.lock().await;
        if let Some(ip) = *resolved {
            return Ok(ip);
        }

        let ip = match self.host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => self.query_a_record().await?,
        };

        tracing::info!("Control host resolved: {} -> {}", self.host, ip);
        *resolved = Some(ip);
        Ok(ip)
    }

    async fn query_a_record(&self) -> Result<IpAddr, ResolveError> {
        let id = query_id();
        let packet = build_query(&self.host, id)?;

        tracing::debug!(
            "Querying {} for A record of {} (id {})",
            self.dns_server,
            self.host,
            id
        );

        let reply = self.exchange(&packet).await?;
        parse_first_a(&reply, id, &self.host)
    }

    async fn exchange(&self, packet: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let socket = protect::bind_udp(self.dns_server, self.protector.as_ref()).await?;

        let sent = socket.send(packet).await?;
        if sent != packet.len() {
            return Err(ResolveError::ShortWrite {
                sent,
                expected: packet.len(),
            });
        }

        let mut buf = vec![0u8; MAX_REPLY_SIZE];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ResolveError::Timeout(self.dns_server))??;
        buf.truncate(n);
        Ok(buf)
    }
}

impl std::fmt::Debug for ProtectedResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedResolver")
            .field("host", &self.host)
            .field("dns_server", &self.dns_server)
            .field("protected", &self.protector.is_some())
            .finish()
    }
}

fn query_id() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos ^ (nanos >> 16)) as u16
}

/// Build a recursive A query for `host`
pub(crate) fn build_query(host: &str, id: u16) -> Result<Vec<u8>, ResolveError> {
    let name = Name::from_ascii(format!("{}.", host.trim_end_matches('.')))?;

    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(name, RecordType::A));

    Ok(msg.to_vec()?)
}

/// Extract the first A record from a reply to query `id`
pub(crate) fn parse_first_a(reply: &[u8], id: u16, host: &str) -> Result<IpAddr, ResolveError> {
    let msg = Message::from_vec(reply)?;
    if msg.id() != id {
        return Err(ResolveError::IdMismatch {
            expected: id,
            got: msg.id(),
        });
    }

    for answer in msg.answers() {
        if let Some(RData::A(a)) = answer.data() {
            return Ok(IpAddr::V4(a.0));
        }
    }

    Err(ResolveError::NoAddressRecord(host.to_string()))
}
