//! End-to-end test utilities for lproxy
//!
//! A mock gateway speaking the tunnel protocol, a mock DNS server for the
//! control-plane resolver and in-memory local connections, so the pool can be
//! exercised without a TUN device or a real gateway.

pub mod certificates;
pub mod harness;
pub mod mock_conn;
pub mod mock_dns;
pub mod mock_gateway;

pub use certificates::TestCertificates;
pub use harness::{all_active, pool_config, start_pool, unused_addr, wait_until, WAIT_TIMEOUT};
pub use mock_conn::{MockConn, MockPeer};
pub use mock_dns::{DnsMode, MockDnsServer};
pub use mock_gateway::{GatewayMode, MockGateway, OpenRecord};
