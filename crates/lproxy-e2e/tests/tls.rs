//! `wss://` gateway end-to-end tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::AsyncWriteExt;

use lproxy::{TunnelPool, TunnelState};
use lproxy_common::{load_certs_from_pem, load_private_key_from_pem};
use lproxy_e2e::{
    pool_config, start_pool, GatewayMode, MockConn, MockGateway, TestCertificates, WAIT_TIMEOUT,
};

fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("lproxy=debug,lproxy_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Gateway TLS config, optionally requiring a client certificate from the test CA
fn server_config(certs: &TestCertificates, require_client_cert: bool) -> Arc<ServerConfig> {
    let cert_chain = load_certs_from_pem(&certs.server_cert_pem).unwrap();
    let key = load_private_key_from_pem(&certs.server_key_pem).unwrap();

    let builder = ServerConfig::builder();
    let config = if require_client_cert {
        let mut roots = RootCertStore::empty();
        for cert in load_certs_from_pem(&certs.ca_cert_pem).unwrap() {
            roots.add(cert).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build().unwrap();
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .unwrap()
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .unwrap()
    };
    Arc::new(config)
}

#[tokio::test]
async fn test_wss_gateway_with_private_ca() {
    init_test();

    let certs = TestCertificates::generate();
    let gateway = MockGateway::start_tls(GatewayMode::Echo, server_config(&certs, false)).await;
    assert!(gateway.url().starts_with("wss://"));

    let mut config = pool_config(&gateway.url(), 2);
    config.ca_cert_pem = Some(certs.ca_cert_pem.clone());
    let pool = start_pool(config).await;

    let dest: SocketAddr = "192.0.2.10:443".parse().unwrap();
    let (conn, mut peer) = MockConn::pair(dest);
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    peer.io.write_all(b"over tls").await.unwrap();
    assert_eq!(peer.read_exactly(8, WAIT_TIMEOUT).await.unwrap(), b"over tls");

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wss_gateway_untrusted_without_ca() {
    init_test();

    let certs = TestCertificates::generate();
    let gateway = MockGateway::start_tls(GatewayMode::Echo, server_config(&certs, false)).await;

    // Only the built-in roots are trusted, the test CA is not among them
    let pool = TunnelPool::new(pool_config(&gateway.url(), 1));
    pool.startup().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.stats()[0].state, TunnelState::Connecting);
    assert_eq!(gateway.session_count(), 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wss_gateway_with_client_certificate() {
    init_test();

    let certs = TestCertificates::generate();
    let gateway = MockGateway::start_tls(GatewayMode::Echo, server_config(&certs, true)).await;

    let mut config = pool_config(&gateway.url(), 1);
    config.ca_cert_pem = Some(certs.ca_cert_pem.clone());
    config.client_cert_pem = Some(certs.client_cert_pem.clone());
    config.client_key_pem = Some(certs.client_key_pem.clone());
    let pool = start_pool(config).await;

    let (conn, mut peer) = MockConn::pair("192.0.2.10:443".parse().unwrap());
    pool.handle_tcp(Box::new(conn)).await.unwrap();
    peer.io.write_all(b"mtls").await.unwrap();
    assert_eq!(peer.read_exactly(4, WAIT_TIMEOUT).await.unwrap(), b"mtls");

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wss_gateway_requires_client_certificate() {
    init_test();

    let certs = TestCertificates::generate();
    let gateway = MockGateway::start_tls(GatewayMode::Echo, server_config(&certs, true)).await;

    let mut config = pool_config(&gateway.url(), 1);
    config.ca_cert_pem = Some(certs.ca_cert_pem.clone());
    let pool = TunnelPool::new(config);
    pool.startup().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_ne!(pool.stats()[0].state, TunnelState::Active);
    assert_eq!(gateway.session_count(), 0);

    pool.shutdown().await.unwrap();
}
