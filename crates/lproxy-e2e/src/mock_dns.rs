//! Mock DNS server for E2E tests
//!
//! Answers A queries over UDP with a fixed address, an empty answer section,
//! or silence, and counts every query it receives.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// How the server answers
#[derive(Clone, Debug)]
pub enum DnsMode {
    /// One A record with this address
    Answer(Ipv4Addr),
    /// NOERROR with no answers
    Empty,
    /// Never reply
    Silent,
}

pub struct MockDnsServer {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockDnsServer {
    pub async fn start(mode: DnsMode) -> Self {
        Self::start_with_delay(mode, Duration::ZERO).await
    }

    /// Start a server that waits `delay` before each reply
    pub async fn start_with_delay(mode: DnsMode, delay: Duration) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock DNS server");
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counter = queries.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let (n, peer) = tokio::select! {
                    _ = token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::error!("Mock DNS recv error: {}", e);
                            break;
                        }
                    },
                };

                counter.fetch_add(1, Ordering::SeqCst);
                let Some(reply) = build_reply(&buf[..n], &mode) else {
                    continue;
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = socket.send_to(&reply, peer).await {
                    tracing::error!("Mock DNS send error: {}", e);
                }
            }
        });

        Self {
            addr,
            queries,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn build_reply(query: &[u8], mode: &DnsMode) -> Option<Vec<u8>> {
    let request = match Message::from_vec(query) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Mock DNS got malformed query: {}", e);
            return None;
        }
    };

    let answers = match mode {
        DnsMode::Silent => return None,
        DnsMode::Empty => Vec::new(),
        DnsMode::Answer(ip) => request
            .queries()
            .iter()
            .map(|q| Record::from_rdata(q.name().clone(), 60, RData::A(A(*ip))))
            .collect(),
    };

    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(request.queries().to_vec());
    reply.add_answers(answers);
    reply.to_vec().ok()
}
