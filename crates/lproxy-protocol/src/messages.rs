use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a logical connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Tcp => write!(f, "tcp"),
            StreamKind::Udp => write!(f, "udp"),
        }
    }
}

/// Destination a logical connection should be opened to by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetAddr {
    /// Already resolved address
    Ip { addr: SocketAddr },
    /// Domain name, resolved by the gateway
    Domain { host: String, port: u16 },
}

impl TargetAddr {
    /// Build a target from a host that may be a literal IP or a domain name
    pub fn from_host_port(host: &str, port: u16) -> Self {
        // Accept bracketed IPv6 literals as handed over by HTTP CONNECT
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip {
                addr: SocketAddr::new(ip, port),
            },
            Err(_) => TargetAddr::Domain {
                host: host.to_string(),
                port,
            },
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip { addr } => addr.port(),
            TargetAddr::Domain { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip { addr }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip { addr } => write!(f, "{}", addr),
            TargetAddr::Domain { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Frames sent from the tunnel client to the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Open a new logical connection
    Open {
        /// Stream ID, unique for the lifetime of the tunnel
        stream_id: u64,
        /// TCP or UDP
        kind: StreamKind,
        /// Where the gateway should connect
        target: TargetAddr,
    },

    /// Payload for an open stream (one datagram for UDP streams)
    Data {
        stream_id: u64,
        data: Vec<u8>,
    },

    /// Local side of the stream closed
    Close {
        stream_id: u64,
    },

    /// Keepalive ping
    Ping {
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },
}

/// Frames sent from the gateway to the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    /// Payload from the remote end of a stream
    Data {
        stream_id: u64,
        data: Vec<u8>,
    },

    /// Remote end of the stream closed (or could not be opened)
    Close {
        stream_id: u64,
    },

    /// Keepalive pong (response to Ping)
    Pong {
        /// Echo back the timestamp
        timestamp: u64,
    },
}
