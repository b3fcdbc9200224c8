//! Pool setup helpers shared by the E2E suites

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lproxy::{PoolConfig, TunnelPool, TunnelState};

/// Upper bound for anything the tests wait on
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A local address nothing listens on
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind scratch socket");
    listener.local_addr().expect("Scratch socket has no address")
}

/// Test config: short keepalive, control DNS pointing at nothing
pub fn pool_config(gateway_url: &str, tunnels: usize) -> PoolConfig {
    let mut config = PoolConfig::new(gateway_url);
    config.tunnel_count = tunnels;
    config.tunnel_capacity = 16;
    config.keepalive_interval = Duration::from_millis(100);
    config.dns_server = unused_addr();
    config
}

/// Whether every tunnel of the pool has a live session
pub fn all_active(pool: &TunnelPool) -> bool {
    let stats = pool.stats();
    !stats.is_empty() && stats.iter().all(|s| s.state == TunnelState::Active)
}

/// Start a pool and wait until all its tunnels are connected
pub async fn start_pool(config: PoolConfig) -> Arc<TunnelPool> {
    let pool = Arc::new(TunnelPool::new(config));
    pool.startup().expect("Failed to start pool");
    assert!(
        wait_until(WAIT_TIMEOUT, || all_active(&pool)).await,
        "Tunnels did not connect: {:?}",
        pool.stats()
    );
    pool
}
