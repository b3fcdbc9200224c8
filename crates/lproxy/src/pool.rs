//! Tunnel pool: admission, tunnel selection and the liveness task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use lproxy_common::{load_client_config, ClientIdentity};

use crate::capture::{close_local, BoxedConn, ProxyTarget};
use crate::config::PoolConfig;
use crate::connector::SessionDialer;
use crate::resolver::ProtectedResolver;
use crate::tunnel::{AdmissionError, Rejected, Tunnel, TunnelStats};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("tunnel pool already startup")]
    AlreadyStarted,

    #[error("tunnel pool not started")]
    NotStarted,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("tunnel pool not started")]
    NotStarted,

    #[error("failed to find valid tunnel among {0}")]
    NoValidTunnel(usize),

    #[error("admission failed: {0}")]
    Admission(#[from] AdmissionError),
}

/// How an accepted connection is proxied
#[derive(Clone, Copy)]
enum Route<'a> {
    Tcp,
    Udp,
    Proxy(&'a ProxyTarget),
}

impl Route<'_> {
    fn label(&self) -> &'static str {
        match self {
            Route::Tcp => "tun/tcp",
            Route::Udp => "tun/udp",
            Route::Proxy(_) => "proxy/tcp",
        }
    }
}

/// Tunnels and the liveness task of a started pool
struct ActivePool {
    tunnels: Vec<Arc<Tunnel>>,
    shutdown: CancellationToken,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

/// A fixed set of tunnels to one gateway
///
/// Constructed once and shared by reference (usually behind an `Arc`) with
/// every capture adapter feeding it connections.
pub struct TunnelPool {
    config: PoolConfig,
    resolver: Arc<ProtectedResolver>,
    cursor: AtomicU64,
    active: RwLock<Option<Arc<ActivePool>>>,
}

impl TunnelPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalize();
        let resolver = Arc::new(ProtectedResolver::new(
            config.control_host(),
            config.dns_server,
            config.protector.clone(),
        ));

        Self {
            config,
            resolver,
            cursor: AtomicU64::new(0),
            active: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Resolver shared by every tunnel of this pool
    pub fn resolver(&self) -> &Arc<ProtectedResolver> {
        &self.resolver
    }

    pub fn is_active(&self) -> bool {
        self.active.read().is_some()
    }

    /// Number of tunnels, zero when not started
    pub fn tunnel_count(&self) -> usize {
        self.active
            .read()
            .as_ref()
            .map(|pool| pool.tunnels.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<TunnelStats> {
        self.active
            .read()
            .as_ref()
            .map(|pool| pool.tunnels.iter().map(|t| t.stats()).collect())
            .unwrap_or_default()
    }

    /// Create the tunnels, start connecting them and launch the liveness task
    ///
    /// Must be called from within a tokio runtime. Returns once the tunnels
    /// are connecting; they become selectable as their sessions come up.
    pub fn startup(&self) -> Result<(), PoolError> {
        let mut active = self.active.write();
        if active.is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let url = Url::parse(&self.config.gateway_url).map_err(|e| {
            PoolError::Config(format!("invalid gateway URL {}: {}", self.config.gateway_url, e))
        })?;
        let tls = match url.scheme() {
            "ws" => None,
            "wss" => {
                let identity = match (&self.config.client_cert_pem, &self.config.client_key_pem) {
                    (Some(cert_pem), Some(key_pem)) => Some(ClientIdentity { cert_pem, key_pem }),
                    _ => None,
                };
                let tls = load_client_config(self.config.ca_cert_pem.as_deref(), identity)
                    .map_err(|e| PoolError::Config(e.to_string()))?;
                Some(Arc::new(tls))
            }
            other => {
                return Err(PoolError::Config(format!(
                    "unsupported gateway scheme {}, expected ws or wss",
                    other
                )))
            }
        };

        let idle = self.config.idle_timeouts();
        let tunnels: Vec<Arc<Tunnel>> = (0..self.config.tunnel_count)
            .map(|index| {
                let dialer = SessionDialer::new(
                    url.clone(),
                    self.resolver.clone(),
                    self.config.protector.clone(),
                    tls.clone(),
                );
                Tunnel::new(index, self.config.tunnel_capacity, idle, dialer)
            })
            .collect();

        for tunnel in &tunnels {
            tunnel.start();
        }

        let shutdown = CancellationToken::new();
        let liveness = tokio::spawn(liveness_loop(
            tunnels.clone(),
            self.config.keepalive_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            "Tunnel pool started: {} tunnels x {} connections to {}",
            tunnels.len(),
            self.config.tunnel_capacity,
            url
        );

        *active = Some(Arc::new(ActivePool {
            tunnels,
            shutdown,
            liveness: Mutex::new(Some(liveness)),
        }));
        Ok(())
    }

    /// Stop every tunnel and wait for the liveness task to exit
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let pool = self.active.write().take().ok_or(PoolError::NotStarted)?;

        for tunnel in &pool.tunnels {
            tunnel.stop();
        }
        pool.shutdown.cancel();

        let liveness = pool.liveness.lock().take();
        if let Some(handle) = liveness {
            if let Err(e) = handle.await {
                tracing::error!("Liveness task failed: {}", e);
            }
        }

        tracing::info!("Tunnel pool shut down");
        Ok(())
    }

    /// Proxy a captured TCP connection to its original destination
    pub async fn handle_tcp(&self, conn: BoxedConn) -> Result<(), HandleError> {
        self.dispatch(conn, Route::Tcp).await
    }

    /// Proxy a captured UDP flow to its original destination
    pub async fn handle_udp(&self, conn: BoxedConn) -> Result<(), HandleError> {
        self.dispatch(conn, Route::Udp).await
    }

    /// Proxy a connection that negotiated its target (SOCKS5, HTTP CONNECT)
    pub async fn handle_http_socks5_tcp(
        &self,
        conn: BoxedConn,
        target: &ProxyTarget,
    ) -> Result<(), HandleError> {
        self.dispatch(conn, Route::Proxy(target)).await
    }

    async fn dispatch(&self, conn: BoxedConn, route: Route<'_>) -> Result<(), HandleError> {
        let id = conn.id();
        let tunnel = match self.allocate() {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::error!("proxy[{}] {}: {}", route.label(), id, e);
                close_local(conn).await;
                return Err(e);
            }
        };

        let admitted = match route {
            Route::Tcp => tunnel.accept_tcp_conn(conn).await,
            Route::Udp => tunnel.accept_udp_conn(conn).await,
            Route::Proxy(target) => tunnel.accept_http_socks5_tcp_conn(conn, target).await,
        };

        match admitted {
            Ok(stream_id) => {
                tracing::info!(
                    "proxy[{}] {} via tunnel {} stream {}",
                    route.label(),
                    id,
                    tunnel.index(),
                    stream_id
                );
                Ok(())
            }
            Err(Rejected { conn, error }) => {
                tracing::error!("proxy[{}] {}: {}", route.label(), id, error);
                close_local(conn).await;
                Err(error.into())
            }
        }
    }

    fn allocate(&self) -> Result<Arc<Tunnel>, HandleError> {
        let pool = self.active.read().clone().ok_or(HandleError::NotStarted)?;
        pick(&self.cursor, &pool.tunnels, |tunnel| tunnel.is_valid())
            .cloned()
            .ok_or(HandleError::NoValidTunnel(pool.tunnels.len()))
    }
}

impl Drop for TunnelPool {
    fn drop(&mut self) {
        if let Some(pool) = self.active.get_mut().take() {
            for tunnel in &pool.tunnels {
                tunnel.stop();
            }
            pool.shutdown.cancel();
        }
    }
}

/// Round-robin scan for a valid item
///
/// Starts at the cursor and visits at most `items.len()` entries. Skipped
/// entries advance the cursor as well, so the next scan starts past the item
/// just picked.
pub(crate) fn pick<'a, T>(
    cursor: &AtomicU64,
    items: &'a [T],
    is_valid: impl Fn(&T) -> bool,
) -> Option<&'a T> {
    let len = items.len() as u64;
    if len == 0 {
        return None;
    }

    let start = cursor.fetch_add(1, Ordering::Relaxed) % len;
    for skipped in 0..len {
        let item = &items[((start + skipped) % len) as usize];
        if is_valid(item) {
            if skipped > 0 {
                cursor.fetch_add(skipped, Ordering::Relaxed);
            }
            return Some(item);
        }
    }
    None
}

async fn liveness_loop(tunnels: Vec<Arc<Tunnel>>, period: Duration, shutdown: CancellationToken) {
    tracing::info!("Liveness task started, tunnel count: {}", tunnels.len());

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for tunnel in &tunnels {
            tunnel.keepalive();
        }

        for tunnel in &tunnels {
            let evicted = tunnel.cache().keepalive();
            if evicted > 0 {
                tracing::debug!("Tunnel {} evicted {} stale connections", tunnel.index(), evicted);
            }
        }

        for tunnel in &tunnels {
            let stats = tunnel.stats();
            tracing::debug!(
                "Tunnel {} {}: {}/{} live, {} streams, up {} B, down {} B",
                stats.index,
                stats.state,
                stats.live_connections,
                stats.capacity,
                stats.total_streams,
                stats.bytes_up,
                stats.bytes_down
            );
        }
    }

    tracing::info!("Liveness task exit");
}
