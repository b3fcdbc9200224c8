mod error;
pub mod protect;
mod tls;

pub use error::TunnelError;
pub use protect::SocketProtector;
pub use tls::{load_certs_from_pem, load_client_config, load_private_key_from_pem, ClientIdentity};
