//! Tunnel pool end-to-end tests

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use lproxy::{HandleError, PoolError, ProxyTarget, SocketProtector, TunnelPool, TunnelState};
use lproxy_e2e::{
    all_active, pool_config, start_pool, unused_addr, wait_until, DnsMode, GatewayMode,
    MockConn, MockDnsServer, MockGateway, WAIT_TIMEOUT,
};
use lproxy_protocol::{StreamKind, TargetAddr};

/// Initialize tracing and crypto provider for tests
fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("lproxy=debug,lproxy_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn destination() -> SocketAddr {
    "93.184.216.34:443".parse().unwrap()
}

#[tokio::test]
async fn test_startup_twice_is_rejected() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 3)).await;

    let err = pool.startup().unwrap_err();
    assert!(matches!(err, PoolError::AlreadyStarted));
    assert!(err.to_string().contains("already startup"));
    assert_eq!(pool.tunnel_count(), 3);

    // No extra tunnels were dialed by the rejected call
    assert!(wait_until(WAIT_TIMEOUT, || gateway.session_count() == 3).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.session_count(), 3);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_requires_startup() {
    init_test();

    let pool = TunnelPool::new(pool_config("ws://127.0.0.1:1/ws", 1));
    assert!(matches!(pool.shutdown().await, Err(PoolError::NotStarted)));

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;
    pool.shutdown().await.unwrap();
    assert!(!pool.is_active());
    assert!(matches!(pool.shutdown().await, Err(PoolError::NotStarted)));
}

#[tokio::test]
async fn test_no_valid_tunnel_closes_connection_once() {
    init_test();

    let url = format!("ws://{}/ws", unused_addr());
    let pool = TunnelPool::new(pool_config(&url, 2));
    pool.startup().unwrap();

    let (conn, mut peer) = MockConn::pair(destination());
    let err = pool.handle_tcp(Box::new(conn)).await.unwrap_err();
    assert!(matches!(err, HandleError::NoValidTunnel(2)));
    assert_eq!(peer.close_count(), 1);
    assert_eq!(peer.read_some(WAIT_TIMEOUT).await.unwrap(), Vec::<u8>::new());

    let (conn, peer) = MockConn::pair("8.8.8.8:53".parse().unwrap());
    assert!(pool.handle_udp(Box::new(conn)).await.is_err());
    assert_eq!(peer.close_count(), 1);

    let (conn, peer) = MockConn::pair(destination());
    let target = ProxyTarget::new("example.com", 443);
    assert!(pool.handle_http_socks5_tcp(Box::new(conn), &target).await.is_err());
    assert_eq!(peer.close_count(), 1);

    for stats in pool.stats() {
        assert_ne!(stats.state, TunnelState::Active);
        assert_eq!(stats.total_streams, 0);
    }

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_before_startup_closes_connection() {
    init_test();

    let pool = TunnelPool::new(pool_config("ws://127.0.0.1:1/ws", 1));
    let (conn, peer) = MockConn::pair(destination());

    let err = pool.handle_tcp(Box::new(conn)).await.unwrap_err();
    assert!(matches!(err, HandleError::NotStarted));
    assert_eq!(peer.close_count(), 1);
}

#[tokio::test]
async fn test_tcp_relay_echo() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    peer.io.write_all(b"hello tunnel").await.unwrap();
    let echoed = peer.read_exactly(12, WAIT_TIMEOUT).await.unwrap();
    assert_eq!(echoed, b"hello tunnel");

    let opens = gateway.opens();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].kind, StreamKind::Tcp);
    assert_eq!(opens[0].target, TargetAddr::Ip { addr: destination() });
    assert_eq!(gateway.received(1, opens[0].stream_id), b"hello tunnel");

    let stats = pool.stats();
    let stats = &stats[0];
    assert_eq!(stats.live_connections, 1);
    assert_eq!(stats.total_streams, 1);
    assert_eq!(stats.bytes_up, 12);
    assert_eq!(stats.bytes_down, 12);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_udp_relay_uses_udp_streams() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let dns: SocketAddr = "8.8.8.8:53".parse().unwrap();
    let (conn, mut peer) = MockConn::pair(dns);
    pool.handle_udp(Box::new(conn)).await.unwrap();

    peer.io.write_all(b"datagram").await.unwrap();
    assert_eq!(peer.read_exactly(8, WAIT_TIMEOUT).await.unwrap(), b"datagram");

    let opens = gateway.opens();
    assert_eq!(opens[0].kind, StreamKind::Udp);
    assert_eq!(opens[0].target, TargetAddr::Ip { addr: dns });

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_udp_datagram_sent_as_one_frame() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair("192.0.2.53:5353".parse().unwrap());
    pool.handle_udp(Box::new(conn)).await.unwrap();

    // Larger than a TCP read, well under the 64 KiB datagram limit
    let datagram: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    peer.io.write_all(&datagram).await.unwrap();
    assert_eq!(peer.read_exactly(datagram.len(), WAIT_TIMEOUT).await.unwrap(), datagram);

    let stream_id = gateway.opens()[0].stream_id;
    assert_eq!(gateway.frame_sizes(1, stream_id), vec![datagram.len()]);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stalled_stream_does_not_stall_tunnel() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let mut config = pool_config(&gateway.url(), 1);
    config.tunnel_capacity = 4;
    let pool = start_pool(config).await;

    // Stream A pushes far more than it will ever read back
    let (conn_a, mut peer_a) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn_a)).await.unwrap();
    let (conn_b, mut peer_b) = MockConn::pair("198.51.100.20:80".parse().unwrap());
    pool.handle_tcp(Box::new(conn_b)).await.unwrap();
    let stream_a = gateway.opens()[0].stream_id;

    // Writes stop once the proxy drops its side of stream A
    let chunk = vec![0x5a; 64 * 1024];
    let flood = async {
        for _ in 0..64 {
            if peer_a.io.write_all(&chunk).await.is_err() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(WAIT_TIMEOUT, flood).await;

    // Only the backlogged stream is closed
    assert!(wait_until(WAIT_TIMEOUT, || peer_a.close_count() == 1).await);
    assert!(wait_until(WAIT_TIMEOUT, || gateway.closes().contains(&(1, stream_a))).await);

    peer_b.io.write_all(b"ping-b").await.unwrap();
    assert_eq!(peer_b.read_exactly(6, WAIT_TIMEOUT).await.unwrap(), b"ping-b");

    // Several keepalive rounds later the session is still the first one
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(gateway.session_count(), 1);
    assert!(all_active(&pool));
    assert_eq!(pool.stats()[0].live_connections, 1);

    peer_b.io.write_all(b"again").await.unwrap();
    assert_eq!(peer_b.read_exactly(5, WAIT_TIMEOUT).await.unwrap(), b"again");

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proxy_target_forwarded_verbatim() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, _peer) = MockConn::pair(destination());
    let target = ProxyTarget::new("example.com", 443);
    pool.handle_http_socks5_tcp(Box::new(conn), &target).await.unwrap();

    let (conn, _peer2) = MockConn::pair(destination());
    let target = ProxyTarget::new("10.1.2.3", 8080);
    pool.handle_http_socks5_tcp(Box::new(conn), &target).await.unwrap();

    let opens = gateway.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(
        opens[0].target,
        TargetAddr::Domain {
            host: "example.com".to_string(),
            port: 443
        }
    );
    assert_eq!(
        opens[1].target,
        TargetAddr::Ip {
            addr: "10.1.2.3:8080".parse().unwrap()
        }
    );
    assert!(opens.iter().all(|o| o.kind == StreamKind::Tcp));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gateway_refusal_closes_local_connection() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Refuse).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    assert_eq!(peer.read_some(WAIT_TIMEOUT).await.unwrap(), Vec::<u8>::new());
    assert!(wait_until(WAIT_TIMEOUT, || peer.close_count() == 1).await);
    assert!(wait_until(WAIT_TIMEOUT, || pool.stats()[0].live_connections == 0).await);

    // The gateway closed the stream, nothing is owed back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.closes().is_empty());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_data_before_gateway_close_is_delivered() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Greet(b"welcome".to_vec())).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    assert_eq!(peer.read_exactly(7, WAIT_TIMEOUT).await.unwrap(), b"welcome");
    assert_eq!(peer.read_some(WAIT_TIMEOUT).await.unwrap(), Vec::<u8>::new());
    assert!(wait_until(WAIT_TIMEOUT, || peer.close_count() == 1).await);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_close_sends_close_frame() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();
    peer.io.write_all(b"bye").await.unwrap();
    assert_eq!(peer.read_exactly(3, WAIT_TIMEOUT).await.unwrap(), b"bye");

    let stream_id = gateway.opens()[0].stream_id;
    peer.io.shutdown().await.unwrap();

    assert!(wait_until(WAIT_TIMEOUT, || gateway.closes() == vec![(1, stream_id)]).await);
    assert!(wait_until(WAIT_TIMEOUT, || pool.stats()[0].live_connections == 0).await);
    assert!(wait_until(WAIT_TIMEOUT, || peer.close_count() == 1).await);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connections_spread_across_tunnels() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 2)).await;

    let mut peers = Vec::new();
    for _ in 0..4 {
        let (conn, peer) = MockConn::pair(destination());
        pool.handle_tcp(Box::new(conn)).await.unwrap();
        peers.push(peer);
    }

    let stats = pool.stats();
    assert_eq!(stats[0].total_streams, 2);
    assert_eq!(stats[1].total_streams, 2);

    let mut sessions: Vec<usize> = gateway.opens().iter().map(|o| o.session).collect();
    sessions.sort_unstable();
    sessions.dedup();
    assert_eq!(sessions.len(), 2);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tunnel_capacity_is_enforced() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let mut config = pool_config(&gateway.url(), 1);
    config.tunnel_capacity = 2;
    let pool = start_pool(config).await;

    let (first, _p1) = MockConn::pair(destination());
    let (second, _p2) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(first)).await.unwrap();
    pool.handle_tcp(Box::new(second)).await.unwrap();

    let (third, peer) = MockConn::pair(destination());
    let err = pool.handle_tcp(Box::new(third)).await.unwrap_err();
    assert!(matches!(err, HandleError::NoValidTunnel(1)));
    assert_eq!(peer.close_count(), 1);
    assert_eq!(gateway.opens().len(), 2);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_session_loss() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    gateway.drop_sessions();

    // Connections riding the lost session are closed
    assert_eq!(peer.read_some(WAIT_TIMEOUT).await.unwrap(), Vec::<u8>::new());
    assert!(wait_until(WAIT_TIMEOUT, || peer.close_count() == 1).await);

    assert!(wait_until(WAIT_TIMEOUT, || gateway.session_count() == 2).await);
    assert!(wait_until(WAIT_TIMEOUT, || all_active(&pool)).await);

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();
    peer.io.write_all(b"again").await.unwrap();
    assert_eq!(peer.read_exactly(5, WAIT_TIMEOUT).await.unwrap(), b"again");

    // Stream ids keep increasing across sessions
    let opens = gateway.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1].session, 2);
    assert!(opens[1].stream_id > opens[0].stream_id);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_pings_force_reconnect() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    gateway.set_answer_pings(false);
    assert!(wait_until(WAIT_TIMEOUT, || gateway.session_count() >= 2).await);
    assert!(gateway.ping_count() >= 3);

    gateway.set_answer_pings(true);
    assert!(wait_until(WAIT_TIMEOUT, || all_active(&pool)).await);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_answered_pings_keep_session() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 1)).await;

    assert!(wait_until(WAIT_TIMEOUT, || gateway.ping_count() >= 6).await);
    assert_eq!(gateway.session_count(), 1);
    assert!(all_active(&pool));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let pool = start_pool(pool_config(&gateway.url(), 2)).await;

    let (conn, mut peer) = MockConn::pair(destination());
    pool.handle_tcp(Box::new(conn)).await.unwrap();

    pool.shutdown().await.unwrap();

    assert_eq!(peer.read_some(WAIT_TIMEOUT).await.unwrap(), Vec::<u8>::new());
    assert!(wait_until(WAIT_TIMEOUT, || peer.close_count() == 1).await);
    assert!(wait_until(WAIT_TIMEOUT, || gateway.live_sessions() == 0).await);

    let (conn, peer) = MockConn::pair(destination());
    let err = pool.handle_tcp(Box::new(conn)).await.unwrap_err();
    assert!(matches!(err, HandleError::NotStarted));
    assert_eq!(peer.close_count(), 1);

    // Sessions are not re-dialed once stopped
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gateway.session_count(), 2);
}

#[tokio::test]
async fn test_gateway_host_resolved_through_control_dns() {
    init_test();

    let gateway = MockGateway::start(GatewayMode::Echo).await;
    let dns = MockDnsServer::start(DnsMode::Answer(Ipv4Addr::LOCALHOST)).await;

    let protected = Arc::new(AtomicUsize::new(0));
    let counter = protected.clone();

    let mut config = pool_config(&format!("ws://gateway.test:{}/ws", gateway.port()), 2);
    config.dns_server = dns.addr();
    config.protector = Some(SocketProtector::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let pool = start_pool(config).await;

    assert_eq!(pool.resolver().host(), "gateway.test");
    assert_eq!(pool.resolver().cached(), Some(Ipv4Addr::LOCALHOST.into()));
    assert_eq!(dns.query_count(), 1);
    assert_eq!(gateway.session_count(), 2);

    // One DNS socket plus one socket per session
    assert_eq!(protected.load(Ordering::SeqCst), 3);

    pool.shutdown().await.unwrap();
}
