//! Mock gateway for E2E tests
//!
//! Accepts tunnel sessions over WebSocket (optionally TLS), records every
//! frame the client sends and answers according to a [`GatewayMode`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use lproxy_protocol::{ClientFrame, GatewayFrame, StreamKind, TargetAddr, TunnelCodec};

/// How the mock answers opened streams
#[derive(Clone, Debug)]
pub enum GatewayMode {
    /// Echo every data frame back on the same stream
    Echo,
    /// Close every stream right after it is opened
    Refuse,
    /// Send a fixed payload on open, then close the stream
    Greet(Vec<u8>),
}

/// A recorded open frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRecord {
    /// Which accepted session (1-based) carried the frame
    pub session: usize,
    pub stream_id: u64,
    pub kind: StreamKind,
    pub target: TargetAddr,
}

struct GatewayState {
    mode: RwLock<GatewayMode>,
    opens: RwLock<Vec<OpenRecord>>,
    closes: RwLock<Vec<(usize, u64)>>,
    received: DashMap<(usize, u64), Vec<u8>>,
    frame_sizes: DashMap<(usize, u64), Vec<usize>>,
    sessions: AtomicUsize,
    live_sessions: AtomicUsize,
    pings: AtomicUsize,
    answer_pings: AtomicBool,
    // Replaced after every drop_sessions()
    kill: RwLock<CancellationToken>,
}

impl GatewayState {
    async fn handle(&self, session: usize, frame: ClientFrame, tx: &mpsc::Sender<GatewayFrame>) {
        match frame {
            ClientFrame::Open {
                stream_id,
                kind,
                target,
            } => {
                tracing::debug!("Mock gateway: session {} open {} {} -> {}", session, kind, stream_id, target);
                self.opens.write().push(OpenRecord {
                    session,
                    stream_id,
                    kind,
                    target,
                });

                let mode = self.mode.read().clone();
                match mode {
                    GatewayMode::Echo => {}
                    GatewayMode::Refuse => {
                        let _ = tx.send(GatewayFrame::Close { stream_id }).await;
                    }
                    GatewayMode::Greet(data) => {
                        let _ = tx.send(GatewayFrame::Data { stream_id, data }).await;
                        let _ = tx.send(GatewayFrame::Close { stream_id }).await;
                    }
                }
            }
            ClientFrame::Data { stream_id, data } => {
                self.frame_sizes
                    .entry((session, stream_id))
                    .or_default()
                    .push(data.len());
                self.received
                    .entry((session, stream_id))
                    .or_default()
                    .extend_from_slice(&data);

                let echo = matches!(*self.mode.read(), GatewayMode::Echo);
                if echo {
                    let _ = tx.send(GatewayFrame::Data { stream_id, data }).await;
                }
            }
            ClientFrame::Close { stream_id } => {
                tracing::debug!("Mock gateway: session {} close {}", session, stream_id);
                self.closes.write().push((session, stream_id));
            }
            ClientFrame::Ping { timestamp } => {
                self.pings.fetch_add(1, Ordering::SeqCst);
                if self.answer_pings.load(Ordering::SeqCst) {
                    let _ = tx.send(GatewayFrame::Pong { timestamp }).await;
                }
            }
        }
    }
}

/// A mock gateway for testing
pub struct MockGateway {
    addr: SocketAddr,
    tls: bool,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
}

impl MockGateway {
    /// Start a plain `ws://` gateway on an ephemeral port
    pub async fn start(mode: GatewayMode) -> Self {
        Self::spawn(mode, None).await
    }

    /// Start a `wss://` gateway with the given server config
    pub async fn start_tls(mode: GatewayMode, tls: Arc<rustls::ServerConfig>) -> Self {
        Self::spawn(mode, Some(TlsAcceptor::from(tls))).await
    }

    async fn spawn(mode: GatewayMode, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock gateway");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(GatewayState {
            mode: RwLock::new(mode),
            opens: RwLock::new(Vec::new()),
            closes: RwLock::new(Vec::new()),
            received: DashMap::new(),
            frame_sizes: DashMap::new(),
            sessions: AtomicUsize::new(0),
            live_sessions: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            answer_pings: AtomicBool::new(true),
            kill: RwLock::new(CancellationToken::new()),
        });
        let shutdown = CancellationToken::new();
        let tls = acceptor.is_some();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Mock gateway accept error: {}", e);
                            break;
                        }
                    },
                };

                let state = accept_state.clone();
                let shutdown = accept_shutdown.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve(tls_stream, state, shutdown).await,
                            Err(e) => tracing::debug!("Mock gateway TLS error from {}: {}", peer_addr, e),
                        },
                        None => serve(stream, state, shutdown).await,
                    }
                });
            }
        });

        Self {
            addr,
            tls,
            state,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Gateway URL with the listener's literal address
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}/ws", scheme, self.addr)
    }

    pub fn set_mode(&self, mode: GatewayMode) {
        *self.state.mode.write() = mode;
    }

    /// Stop answering pings, simulating a stalled gateway
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Total sessions accepted so far
    pub fn session_count(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state.live_sessions.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.state.opens.read().clone()
    }

    /// (session, stream_id) of every close frame received
    pub fn closes(&self) -> Vec<(usize, u64)> {
        self.state.closes.read().clone()
    }

    /// Bytes received on one stream of one session
    pub fn received(&self, session: usize, stream_id: u64) -> Vec<u8> {
        self.state
            .received
            .get(&(session, stream_id))
            .map(|data| data.value().clone())
            .unwrap_or_default()
    }

    /// Payload length of each data frame received on one stream
    pub fn frame_sizes(&self, session: usize, stream_id: u64) -> Vec<usize> {
        self.state
            .frame_sizes
            .get(&(session, stream_id))
            .map(|sizes| sizes.value().clone())
            .unwrap_or_default()
    }

    /// Drop every live session; the listener keeps accepting
    pub fn drop_sessions(&self) {
        let old = std::mem::replace(&mut *self.state.kill.write(), CancellationToken::new());
        old.cancel();
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve<S>(stream: S, state: Arc<GatewayState>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            tracing::debug!("Mock gateway handshake failed: {}", e);
            return;
        }
    };

    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    state.live_sessions.fetch_add(1, Ordering::SeqCst);
    let kill = state.kill.read().clone();
    tracing::debug!("Mock gateway: session {} accepted", session);

    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<GatewayFrame>(64);

    let writer = tokio::spawn(async move {
        let mut codec = TunnelCodec::<GatewayFrame>::new();
        while let Some(frame) = rx.recv().await {
            let bytes = match codec.encode_to_vec(frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Mock gateway encode error: {}", e);
                    break;
                }
            };
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut codec = TunnelCodec::<ClientFrame>::new();
    let mut buf = BytesMut::new();
    loop {
        let message = tokio::select! {
            _ = kill.cancelled() => break,
            _ = shutdown.cancelled() => break,
            message = source.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                buf.extend_from_slice(&data);
                let frames = match codec.decode_all(&mut buf) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::error!("Mock gateway decode error: {}", e);
                        break;
                    }
                };
                for frame in frames {
                    state.handle(session, frame, &tx).await;
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    drop(tx);
    let _ = writer.await;
    state.live_sessions.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!("Mock gateway: session {} ended", session);
}
