use thiserror::Error;

/// Common errors for tunnel transport setup
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),
}
