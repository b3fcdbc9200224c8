//! SOCKS5 / HTTP CONNECT front-end end-to-end tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use lproxy::{ProxyListener, TunnelPool};
use lproxy_e2e::{pool_config, start_pool, wait_until, GatewayMode, MockGateway, WAIT_TIMEOUT};
use lproxy_protocol::{StreamKind, TargetAddr};

fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("lproxy=debug,lproxy_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// Bind a listener on an ephemeral port and serve it in the background
async fn serve_proxy(pool: Arc<TunnelPool>) -> SocketAddr {
    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), pool)
        .await
        .expect("Failed to bind proxy listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    addr
}

async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("Read timed out")
        .expect("Read failed");
    buf
}

#[tokio::test]
async fn test_socks5_connect_through_tunnel() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;
    let proxy = serve_proxy(pool.clone()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, 2).await, [0x05, 0x00]);

    let host = b"echo.test";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&7u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let reply = read_exact_timeout(&mut client, 10).await;
    assert_eq!(reply[..2], [0x05, 0x00]);

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, 4).await, b"ping");

    let opens = gateway.opens();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].kind, StreamKind::Tcp);
    assert_eq!(
        opens[0].target,
        TargetAddr::Domain {
            host: "echo.test".to_string(),
            port: 7
        }
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_connect_through_tunnel() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;
    let proxy = serve_proxy(pool.clone()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT 10.1.2.3:8443 HTTP/1.1\r\nHost: 10.1.2.3:8443\r\n\r\n")
        .await
        .unwrap();

    let status = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    assert_eq!(read_exact_timeout(&mut client, status.len()).await, status);

    client.write_all(b"tls bytes").await.unwrap();
    assert_eq!(read_exact_timeout(&mut client, 9).await, b"tls bytes");

    let opens = gateway.opens();
    assert_eq!(
        opens[0].target,
        TargetAddr::Ip {
            addr: "10.1.2.3:8443".parse().unwrap()
        }
    );

    // Client hang-up is propagated as a stream close
    let stream_id = opens[0].stream_id;
    drop(client);
    assert!(wait_until(WAIT_TIMEOUT, || gateway.closes() == vec![(1, stream_id)]).await);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxy_client_dropped_without_tunnel() {
    init_test();

    let url = format!("ws://{}/ws", lproxy_e2e::unused_addr());
    let pool = Arc::new(TunnelPool::new(pool_config(&url, 1)));
    pool.startup().unwrap();
    let proxy = serve_proxy(pool.clone()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    // Success is replied before a tunnel is picked; the connection then closes
    let mut received = Vec::new();
    let read = tokio::time::timeout(WAIT_TIMEOUT, client.read_to_end(&mut received)).await;
    assert!(read.is_ok(), "Connection was not closed");
    assert!(received.starts_with(b"HTTP/1.1 200"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.shutdown().await.unwrap();
}
