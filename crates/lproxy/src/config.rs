//! Pool configuration and its file/environment resolution
//!
//! File and environment settings are resolved in this order (first found wins):
//! 1. Environment variables (LPROXY_*)
//! 2. Config file (lproxy.toml)
//! 3. Default values

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use lproxy_common::SocketProtector;

use crate::cache::IdleTimeouts;
use crate::connector::url_host;

/// Environment variable prefix
const ENV_PREFIX: &str = "LPROXY";

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_TUNNEL_CAPACITY: usize = 100;
pub const DEFAULT_DNS_SERVER: &str = "223.5.5.5:53";
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";

/// Host used for resolution when the gateway URL is unusable
const FALLBACK_CONTROL_HOST: &str = "127.0.0.1";

/// Settings for a [`TunnelPool`](crate::TunnelPool)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Gateway WebSocket URL (`ws://` or `wss://`)
    pub gateway_url: String,
    pub tunnel_count: usize,
    /// Max concurrent logical connections per tunnel
    pub tunnel_capacity: usize,
    /// DNS server used for the gateway host only
    pub dns_server: SocketAddr,
    pub tcp_idle_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Extra CA for `wss://`; webpki roots otherwise
    pub ca_cert_pem: Option<String>,
    /// Client certificate and key for gateways requiring mTLS
    pub client_cert_pem: Option<String>,
    pub client_key_pem: Option<String>,
    pub protector: Option<SocketProtector>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let idle = IdleTimeouts::default();
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            tunnel_count: 1,
            tunnel_capacity: DEFAULT_TUNNEL_CAPACITY,
            dns_server: SocketAddr::from(([223, 5, 5, 5], 53)),
            tcp_idle_timeout: idle.tcp,
            udp_idle_timeout: idle.udp,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            ca_cert_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
            protector: None,
        }
    }
}

impl PoolConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            ..Self::default()
        }
    }

    /// Substitute defaults for empty or zero values
    pub fn normalize(mut self) -> Self {
        if self.gateway_url.trim().is_empty() {
            self.gateway_url = DEFAULT_GATEWAY_URL.to_string();
        }
        if self.tunnel_count < 1 {
            self.tunnel_count = 1;
        }
        if self.tunnel_capacity < 1 {
            self.tunnel_capacity = DEFAULT_TUNNEL_CAPACITY;
        }
        if self.keepalive_interval.is_zero() {
            self.keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL;
        }
        self
    }

    /// Host part of the gateway URL, the only name the resolver answers for
    pub fn control_host(&self) -> String {
        match Url::parse(&self.gateway_url) {
            Ok(url) => match url_host(&url) {
                Some(host) => host,
                None => {
                    tracing::error!("Gateway URL {} has no host", self.gateway_url);
                    FALLBACK_CONTROL_HOST.to_string()
                }
            },
            Err(e) => {
                tracing::error!("Failed to parse gateway URL {}: {}", self.gateway_url, e);
                FALLBACK_CONTROL_HOST.to_string()
            }
        }
    }

    pub fn idle_timeouts(&self) -> IdleTimeouts {
        IdleTimeouts {
            tcp: self.tcp_idle_timeout,
            udp: self.udp_idle_timeout,
        }
    }
}

/// Binary configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// Gateway WebSocket URL
    pub gateway_url: Option<String>,

    pub tunnel_count: Option<usize>,

    pub tunnel_capacity: Option<usize>,

    /// DNS server for the gateway host (ip:port)
    pub dns_server: Option<String>,

    pub tcp_idle_timeout_secs: Option<u64>,

    pub udp_idle_timeout_secs: Option<u64>,

    pub keepalive_interval_secs: Option<u64>,

    /// CA certificate for wss (file path)
    #[serde(alias = "ca_cert_path")]
    pub ca_cert: Option<String>,

    /// Client certificate for mTLS gateways (file path)
    #[serde(alias = "cert_path")]
    pub cert: Option<String>,

    /// Client private key for mTLS gateways (file path)
    #[serde(alias = "key_path")]
    pub key: Option<String>,

    /// SOCKS5 / HTTP CONNECT listen address
    pub listen: Option<String>,
}

/// Fully resolved binary configuration
#[derive(Debug)]
pub struct ResolvedConfig {
    pub pool: PoolConfig,
    pub listen: SocketAddr,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Read a PEM file named by env or config
fn read_pem(kind: &str, path: Option<String>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Failed to read {} {}: {}", kind, path, e)),
        None => Ok(None),
    }
}

/// Get environment variable parsed as `T`
fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

impl FileConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        let defaults = PoolConfig::default();

        // Gateway URL: ENV > config > default
        let gateway_url = get_env("GATEWAY_URL")
            .or(self.gateway_url)
            .unwrap_or(defaults.gateway_url);

        let tunnel_count = get_env_parsed("TUNNEL_COUNT")
            .or(self.tunnel_count)
            .unwrap_or(defaults.tunnel_count);

        let tunnel_capacity = get_env_parsed("TUNNEL_CAPACITY")
            .or(self.tunnel_capacity)
            .unwrap_or(defaults.tunnel_capacity);

        let dns_server = get_env("DNS_SERVER")
            .or(self.dns_server)
            .unwrap_or_else(|| DEFAULT_DNS_SERVER.to_string());
        let dns_server: SocketAddr = dns_server
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid DNS server {}: {}", dns_server, e))?;

        let tcp_idle_timeout = get_env_parsed("TCP_IDLE_TIMEOUT_SECS")
            .or(self.tcp_idle_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.tcp_idle_timeout);

        let udp_idle_timeout = get_env_parsed("UDP_IDLE_TIMEOUT_SECS")
            .or(self.udp_idle_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.udp_idle_timeout);

        let keepalive_interval = get_env_parsed("KEEPALIVE_INTERVAL_SECS")
            .or(self.keepalive_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.keepalive_interval);

        // PEM files: ENV_FILE > config > none
        let ca_cert_pem = read_pem("CA certificate", get_env("CA_CERT_FILE").or(self.ca_cert))?;
        let client_cert_pem = read_pem("client certificate", get_env("CERT_FILE").or(self.cert))?;
        let client_key_pem = read_pem("client key", get_env("KEY_FILE").or(self.key))?;
        if client_cert_pem.is_some() != client_key_pem.is_some() {
            anyhow::bail!("Client certificate and key must be configured together");
        }

        let listen = get_env("LISTEN")
            .or(self.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", listen, e))?;

        Ok(ResolvedConfig {
            pool: PoolConfig {
                gateway_url,
                tunnel_count,
                tunnel_capacity,
                dns_server,
                tcp_idle_timeout,
                udp_idle_timeout,
                keepalive_interval,
                ca_cert_pem,
                client_cert_pem,
                client_key_pem,
                protector: None,
            },
            listen,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}
