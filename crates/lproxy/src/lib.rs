//! IP-layer proxy client
//!
//! Connections reconstructed by a capture adapter (a user-space stack behind
//! a TUN device, or the bundled SOCKS5 / HTTP CONNECT listener) are spread
//! over a fixed pool of WebSocket tunnels to a gateway. Each tunnel
//! multiplexes many logical connections and reconnects on its own; the
//! gateway host is resolved through a protected DNS path so neither the
//! lookup nor the sessions loop back into the capture.

pub mod cache;
pub mod capture;
pub mod config;
pub mod connector;
pub mod listener;
pub mod pool;
pub mod resolver;
pub mod tunnel;

pub use cache::{CacheError, ConnectionCache, Delivery, IdleTimeouts, LogicalConnection};
pub use capture::{close_local, BoxedConn, EndpointId, LocalConn, ProxyTarget};
pub use config::{FileConfig, PoolConfig, ResolvedConfig};
pub use listener::ProxyListener;
pub use lproxy_common::SocketProtector;
pub use pool::{HandleError, PoolError, TunnelPool};
pub use resolver::{ProtectedResolver, ResolveError};
pub use tunnel::{AdmissionError, Rejected, Tunnel, TunnelState, TunnelStats};
