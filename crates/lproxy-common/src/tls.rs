use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;

use crate::TunnelError;

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Certificate("No private key found in PEM content".to_string()))
}

/// Build the trust store for gateway certificates
///
/// With no CA given the bundled Mozilla roots are used, otherwise only the
/// certificates in `ca_pem` are trusted (self-hosted gateways).
fn load_root_store(ca_pem: Option<&str>) -> Result<RootCertStore, TunnelError> {
    let mut root_store = RootCertStore::empty();
    match ca_pem {
        None => {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        Some(pem) => {
            let ca_certs = load_certs_from_pem(pem)?;
            if ca_certs.is_empty() {
                return Err(TunnelError::Certificate(
                    "No CA certificate found in PEM content".to_string(),
                ));
            }
            for cert in ca_certs {
                root_store.add(cert).map_err(|e| {
                    TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
                })?;
            }
        }
    }
    Ok(root_store)
}

/// Client identity presented to gateways that require mTLS
pub struct ClientIdentity<'a> {
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
}

/// Load the TLS client config used for `wss://` gateway sessions
///
/// # Arguments
/// * `ca_pem` - CA certificate PEM content, `None` for the public web PKI
/// * `identity` - optional client certificate and key for mTLS
pub fn load_client_config(
    ca_pem: Option<&str>,
    identity: Option<ClientIdentity<'_>>,
) -> Result<ClientConfig, TunnelError> {
    let root_store = load_root_store(ca_pem)?;
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match identity {
        Some(identity) => {
            let certs = load_certs_from_pem(identity.cert_pem)?;
            let key = load_private_key_from_pem(identity.key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TunnelError::Tls(format!("Failed to build client config: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_crypto() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_default_roots_config() {
        init_crypto();
        assert!(load_client_config(None, None).is_ok());
    }

    #[test]
    fn test_empty_ca_pem_is_rejected() {
        init_crypto();
        let result = load_client_config(Some("not a certificate"), None);
        assert!(matches!(result, Err(TunnelError::Certificate(_))));
    }

    #[test]
    fn test_missing_private_key() {
        let result = load_private_key_from_pem("");
        assert!(matches!(result, Err(TunnelError::Certificate(_))));
    }
}
