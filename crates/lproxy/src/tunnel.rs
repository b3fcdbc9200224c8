//! A tunnel: one persistent gateway session multiplexing many logical connections

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use url::Url;

use lproxy_protocol::{ClientFrame, GatewayFrame, StreamKind, TargetAddr, TunnelCodec};

use crate::cache::{CacheError, ConnectionCache, Delivery, IdleTimeouts, Inbound, LogicalConnection};
use crate::capture::{BoxedConn, EndpointId, ProxyTarget};
use crate::connector::{SessionDialer, WsStream};

/// Outgoing frames buffered per session
const FRAME_CHANNEL_SIZE: usize = 256;

/// Read size for the local side of a TCP relay
const TCP_READ_SIZE: usize = 16 * 1024;

/// Read size for a UDP relay: every read is one whole datagram
const UDP_READ_SIZE: usize = 64 * 1024;

/// Unanswered pings after which the session is considered dead
pub const MAX_MISSED_PONGS: u32 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected = 0,
    Connecting = 1,
    Active = 2,
    Closed = 3,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TunnelState::Connecting,
            2 => TunnelState::Active,
            3 => TunnelState::Closed,
            _ => TunnelState::Disconnected,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Tunnel {0} is {1}")]
    NotActive(usize, TunnelState),

    #[error("Tunnel {0} is at capacity ({1})")]
    AtCapacity(usize, usize),

    #[error("Tunnel {0} lost its session")]
    SessionClosed(usize),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A refused admission; the local connection goes back to the caller to close
pub struct Rejected {
    pub conn: BoxedConn,
    pub error: AdmissionError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("endpoint", &self.conn.id())
            .field("error", &self.error)
            .finish()
    }
}

/// Point-in-time counters for one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStats {
    pub index: usize,
    pub state: TunnelState,
    pub live_connections: usize,
    pub capacity: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_streams: u64,
}

/// A registered connection waiting for its open frame
struct Admitted {
    logical: Arc<LogicalConnection>,
    inbound: mpsc::Receiver<Inbound>,
    frames: mpsc::Sender<ClientFrame>,
}

struct Session {
    generation: u64,
    frames: mpsc::Sender<ClientFrame>,
    cancel: CancellationToken,
}

pub struct Tunnel {
    index: usize,
    capacity: usize,
    state: AtomicU8,
    cache: ConnectionCache,
    dialer: SessionDialer,
    // State changes that involve the session happen under this lock
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    dialing: AtomicBool,
    missed_pongs: AtomicU32,
    // Never reused for the lifetime of the tunnel, reconnects included
    next_stream_id: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    total_streams: AtomicU64,
}

impl Tunnel {
    pub fn new(index: usize, capacity: usize, idle: IdleTimeouts, dialer: SessionDialer) -> Arc<Self> {
        Arc::new(Self {
            index,
            capacity,
            state: AtomicU8::new(TunnelState::Disconnected as u8),
            cache: ConnectionCache::new(capacity, idle),
            dialer,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            dialing: AtomicBool::new(false),
            missed_pongs: AtomicU32::new(0),
            next_stream_id: AtomicU64::new(1),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            total_streams: AtomicU64::new(0),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn url(&self) -> &Url {
        self.dialer.url()
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TunnelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Selectable for a new connection: session up and room in the cache
    pub fn is_valid(&self) -> bool {
        self.state() == TunnelState::Active && self.cache.has_capacity()
    }

    /// Begin connecting; returns immediately
    pub fn start(self: &Arc<Self>) {
        {
            let _session = self.session.lock();
            if self.state() == TunnelState::Closed {
                return;
            }
            self.set_state(TunnelState::Connecting);
        }
        self.spawn_connect();
    }

    /// Close the tunnel for good, along with every logical connection
    pub fn stop(&self) {
        let session = {
            let mut session = self.session.lock();
            self.set_state(TunnelState::Closed);
            session.take()
        };

        if let Some(session) = session {
            session.cancel.cancel();
        }
        let closed = self.cache.close_all();
        tracing::info!("Tunnel {} stopped, closed {} connections", self.index, closed);
    }

    /// Periodic liveness step, driven by the pool
    ///
    /// Retries the session while disconnected. While active, sends a ping and
    /// drops the session once too many pings went unanswered.
    pub fn keepalive(self: &Arc<Self>) {
        match self.state() {
            TunnelState::Disconnected | TunnelState::Connecting => self.spawn_connect(),
            TunnelState::Active => {
                let missed = self.missed_pongs.fetch_add(1, Ordering::AcqRel);
                if missed >= MAX_MISSED_PONGS {
                    tracing::warn!(
                        "Tunnel {} missed {} pongs, dropping session",
                        self.index,
                        missed
                    );
                    self.teardown(None);
                    return;
                }

                let frames = self.session.lock().as_ref().map(|s| s.frames.clone());
                if let Some(frames) = frames {
                    let ping = ClientFrame::Ping {
                        timestamp: now_millis(),
                    };
                    if frames.try_send(ping).is_err() {
                        tracing::debug!("Tunnel {} ping not queued, session busy", self.index);
                    }
                }
            }
            TunnelState::Closed => {}
        }
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            index: self.index,
            state: self.state(),
            live_connections: self.cache.len(),
            capacity: self.capacity,
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
        }
    }

    /// Admit a captured TCP connection, proxied to its original destination
    pub async fn accept_tcp_conn(self: &Arc<Self>, conn: BoxedConn) -> Result<u64, Rejected> {
        let target = TargetAddr::from(conn.id().local_addr);
        self.admit(conn, StreamKind::Tcp, target).await
    }

    /// Admit a captured UDP flow, proxied to its original destination
    pub async fn accept_udp_conn(self: &Arc<Self>, conn: BoxedConn) -> Result<u64, Rejected> {
        let target = TargetAddr::from(conn.id().local_addr);
        self.admit(conn, StreamKind::Udp, target).await
    }

    /// Admit a proxy-protocol connection; the target goes to the gateway as given
    pub async fn accept_http_socks5_tcp_conn(
        self: &Arc<Self>,
        conn: BoxedConn,
        target: &ProxyTarget,
    ) -> Result<u64, Rejected> {
        self.admit(conn, StreamKind::Tcp, target.to_target_addr()).await
    }

    async fn admit(
        self: &Arc<Self>,
        conn: BoxedConn,
        kind: StreamKind,
        target: TargetAddr,
    ) -> Result<u64, Rejected> {
        let endpoint = conn.id();
        let admitted = match self.reserve(kind, endpoint, &target) {
            Ok(admitted) => admitted,
            Err(error) => return Err(Rejected { conn, error }),
        };
        let Admitted {
            logical,
            inbound,
            frames,
        } = admitted;
        let stream_id = logical.stream_id();

        let open = ClientFrame::Open {
            stream_id,
            kind,
            target: target.clone(),
        };
        if frames.send(open).await.is_err() {
            self.cache.remove(stream_id);
            return Err(Rejected {
                conn,
                error: AdmissionError::SessionClosed(self.index),
            });
        }

        self.total_streams.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Tunnel {} opened {} stream {}: {} via {}",
            self.index,
            kind,
            stream_id,
            endpoint,
            target
        );

        let tunnel = self.clone();
        tokio::spawn(async move {
            tunnel.relay(conn, logical, inbound, frames).await;
        });
        Ok(stream_id)
    }

    /// Register a new logical connection on the current session
    ///
    /// Runs under the session lock, so a concurrent teardown either sees the
    /// entry and closes it or has already removed the session.
    fn reserve(
        &self,
        kind: StreamKind,
        endpoint: EndpointId,
        target: &TargetAddr,
    ) -> Result<Admitted, AdmissionError> {
        let session = self.session.lock();
        let state = self.state();
        if state != TunnelState::Active {
            return Err(AdmissionError::NotActive(self.index, state));
        }
        if !self.cache.has_capacity() {
            return Err(AdmissionError::AtCapacity(self.index, self.capacity));
        }
        let frames = session
            .as_ref()
            .map(|s| s.frames.clone())
            .ok_or(AdmissionError::SessionClosed(self.index))?;

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (logical, inbound) = LogicalConnection::new(stream_id, kind, endpoint, target.clone());
        self.cache.register(logical.clone())?;

        Ok(Admitted {
            logical,
            inbound,
            frames,
        })
    }

    /// Pump bytes between a local connection and its stream until either
    /// side finishes or the connection is closed from the cache
    async fn relay(
        self: Arc<Self>,
        conn: BoxedConn,
        logical: Arc<LogicalConnection>,
        mut inbound: mpsc::Receiver<Inbound>,
        frames: mpsc::Sender<ClientFrame>,
    ) {
        let stream_id = logical.stream_id();
        let (mut reader, mut writer) = tokio::io::split(conn);

        let uplink = async {
            let mut buf = vec![0u8; read_size(logical.kind())];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("Local side of stream {} closed", stream_id);
                        break;
                    }
                    Ok(n) => {
                        logical.touch();
                        self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                        let data = buf[..n].to_vec();
                        if frames.send(ClientFrame::Data { stream_id, data }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Local read error on stream {}: {}", stream_id, e);
                        break;
                    }
                }
            }
        };

        let downlink = async {
            while let Some(item) = inbound.recv().await {
                match item {
                    Inbound::Payload(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            tracing::debug!("Local write error on stream {}: {}", stream_id, e);
                            break;
                        }
                        logical.touch();
                    }
                    Inbound::Fin => break,
                }
            }
        };

        tokio::select! {
            _ = uplink => {}
            _ = downlink => {}
            _ = logical.closed() => {}
        }

        self.cache.remove(stream_id);
        if !logical.is_remote_closed() {
            let _ = frames.send(ClientFrame::Close { stream_id }).await;
        }
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Closing local side of stream {}: {}", stream_id, e);
        }
        tracing::debug!("Stream {} finished on tunnel {}", stream_id, self.index);
    }

    fn spawn_connect(self: &Arc<Self>) {
        if self.dialing.swap(true, Ordering::AcqRel) {
            return;
        }

        let tunnel = self.clone();
        tokio::spawn(async move {
            match tunnel.dialer.dial().await {
                Ok(ws_stream) => tunnel.on_connected(ws_stream),
                Err(e) => {
                    tracing::warn!(
                        "Tunnel {} failed to connect to {}: {:#}",
                        tunnel.index,
                        tunnel.url(),
                        e
                    );
                }
            }
            tunnel.dialing.store(false, Ordering::Release);
        });
    }

    fn on_connected(self: &Arc<Self>, ws_stream: WsStream) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        {
            let mut session = self.session.lock();
            if self.state() != TunnelState::Connecting {
                tracing::debug!("Tunnel {} no longer connecting, dropping new session", self.index);
                return;
            }
            *session = Some(Session {
                generation,
                frames: frames_tx,
                cancel: cancel.clone(),
            });
            self.missed_pongs.store(0, Ordering::Release);
            self.set_state(TunnelState::Active);
        }

        tracing::info!("Tunnel {} connected to {}", self.index, self.url());

        let tunnel = self.clone();
        tokio::spawn(async move {
            tunnel.run_session(ws_stream, frames_rx, cancel, generation).await;
        });
    }

    async fn run_session(
        self: Arc<Self>,
        ws_stream: WsStream,
        mut frames_rx: mpsc::Receiver<ClientFrame>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let (mut sink, mut source) = ws_stream.split();
        let index = self.index;

        // Write task
        let writer_cancel = cancel.clone();
        let write_handle = tokio::spawn(async move {
            let mut codec = TunnelCodec::<ClientFrame>::new();
            let mut write_buf = BytesMut::with_capacity(8192);

            loop {
                let frame = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = frames_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                write_buf.clear();
                if let Err(e) = codec.encode(frame, &mut write_buf) {
                    tracing::error!("Tunnel {} failed to encode frame: {}", index, e);
                    break;
                }
                if let Err(e) = sink.send(Message::Binary(write_buf.to_vec())).await {
                    tracing::error!("Tunnel {} failed to write frame: {}", index, e);
                    break;
                }
            }

            writer_cancel.cancel();
            if let Err(e) = sink.close().await {
                tracing::debug!("Tunnel {} WebSocket close: {}", index, e);
            }
        });

        // Read loop
        let mut codec = TunnelCodec::<GatewayFrame>::new();
        let mut read_buf = BytesMut::with_capacity(8192);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = source.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => {
                    read_buf.extend_from_slice(&data);
                    match codec.decode_all(&mut read_buf) {
                        Ok(frames) => {
                            for frame in frames {
                                self.dispatch(frame);
                            }
                        }
                        Err(e) => {
                            tracing::error!("Tunnel {} decode error: {}", index, e);
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("Gateway closed the session of tunnel {}", index);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Tunnel {} read error: {}", index, e);
                    break;
                }
                None => {
                    tracing::info!("Gateway disconnected tunnel {}", index);
                    break;
                }
            }
        }

        cancel.cancel();
        let _ = write_handle.await;
        self.teardown(Some(generation));
    }

    /// Route one gateway frame; never waits on a local connection
    fn dispatch(&self, frame: GatewayFrame) {
        match frame {
            GatewayFrame::Data { stream_id, data } => {
                let Some(conn) = self.cache.get(stream_id) else {
                    tracing::debug!(
                        "Tunnel {} data for unknown stream {} (may have been closed)",
                        self.index,
                        stream_id
                    );
                    return;
                };

                self.bytes_down.fetch_add(data.len() as u64, Ordering::Relaxed);
                conn.touch();
                match conn.deliver(data) {
                    Delivery::Queued => {}
                    Delivery::Backlogged => {
                        // Closing it sends the gateway a close for this stream only
                        tracing::warn!(
                            "Tunnel {} stream {} not draining, closing it",
                            self.index,
                            stream_id
                        );
                        self.cache.remove(stream_id);
                    }
                    Delivery::Gone => {
                        tracing::debug!("Stream {} relay already gone", stream_id);
                    }
                }
            }
            GatewayFrame::Close { stream_id } => {
                tracing::debug!("Gateway closed stream {}", stream_id);
                if let Some(conn) = self.cache.get(stream_id) {
                    if conn.finish() == Delivery::Gone {
                        self.cache.remove(stream_id);
                    }
                }
            }
            GatewayFrame::Pong { timestamp } => {
                self.missed_pongs.store(0, Ordering::Release);
                tracing::trace!(
                    "Tunnel {} pong, rtt {}ms",
                    self.index,
                    now_millis().saturating_sub(timestamp)
                );
            }
        }
    }

    /// Drop the current session and every connection riding on it
    ///
    /// With a generation, only that session is torn down: a late teardown
    /// from a replaced session must not touch its successor.
    fn teardown(&self, generation: Option<u64>) {
        let lost = {
            let mut session = self.session.lock();
            let current = session.as_ref().map(|s| s.generation);
            if current.is_none() || (generation.is_some() && generation != current) {
                return;
            }
            if self.state() == TunnelState::Active {
                self.set_state(TunnelState::Connecting);
            }
            session.take()
        };

        if let Some(session) = lost {
            session.cancel.cancel();
            let closed = self.cache.close_all();
            tracing::warn!(
                "Tunnel {} lost its session, closed {} connections, reconnecting",
                self.index,
                closed
            );
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("index", &self.index)
            .field("url", &self.url().as_str())
            .field("state", &self.state())
            .field("live", &self.cache.len())
            .finish()
    }
}

fn read_size(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Tcp => TCP_READ_SIZE,
        StreamKind::Udp => UDP_READ_SIZE,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
