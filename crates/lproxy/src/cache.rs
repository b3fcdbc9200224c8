//! Per-tunnel registry of live logical connections

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lproxy_protocol::{StreamKind, TargetAddr};

use crate::capture::EndpointId;

/// Gateway payloads buffered per logical connection; a relay that falls
/// this far behind is closed rather than allowed to stall the session
pub const INBOUND_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Stream {0} already registered")]
    DuplicateStream(u64),

    #[error("Connection cache full ({0} entries)")]
    Full(usize),
}

/// Idle thresholds after which a logical connection is considered stale
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
}

impl IdleTimeouts {
    pub fn for_kind(&self, kind: StreamKind) -> Duration {
        match kind {
            StreamKind::Tcp => self.tcp,
            StreamKind::Udp => self.udp,
        }
    }
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(300),
            udp: Duration::from_secs(60),
        }
    }
}

/// Item handed from the session reader to a relay
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Payload(Vec<u8>),
    /// The gateway closed the stream; nothing follows
    Fin,
}

/// Outcome of handing gateway payload to a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The relay is not keeping up with the gateway
    Backlogged,
    /// The relay has already finished
    Gone,
}

/// One proxied TCP/UDP flow inside a tunnel
///
/// The local handle itself is owned by the relay task; the cache keeps the
/// means to feed it gateway data and to close it.
pub struct LogicalConnection {
    stream_id: u64,
    kind: StreamKind,
    endpoint: EndpointId,
    target: TargetAddr,
    inbound: mpsc::Sender<Inbound>,
    closer: CancellationToken,
    remote_closed: AtomicBool,
    last_active: Mutex<Instant>,
}

impl LogicalConnection {
    /// Create a connection and the receiver its relay drains gateway data from
    pub fn new(
        stream_id: u64,
        kind: StreamKind,
        endpoint: EndpointId,
        target: TargetAddr,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let conn = Arc::new(Self {
            stream_id,
            kind,
            endpoint,
            target,
            inbound,
            closer: CancellationToken::new(),
            remote_closed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        });
        (conn, inbound_rx)
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Record traffic on this connection
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    /// Ask the relay to close both sides; idempotent
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once the connection has been asked to close
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }

    /// The gateway closed its side: no close frame is owed, and the relay
    /// ends after writing out what it already received
    ///
    /// Never waits. When the relay is backlogged the end marker is queued
    /// from a separate task so it still lands after the pending payload.
    pub fn finish(self: &Arc<Self>) -> Delivery {
        self.remote_closed.store(true, Ordering::SeqCst);
        match self.inbound.try_send(Inbound::Fin) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
            Err(TrySendError::Full(_)) => {
                let conn = self.clone();
                tokio::spawn(async move {
                    let _ = conn.inbound.send(Inbound::Fin).await;
                });
                Delivery::Backlogged
            }
        }
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    /// Hand gateway payload to the relay without waiting
    pub fn deliver(&self, data: Vec<u8>) -> Delivery {
        match self.inbound.try_send(Inbound::Payload(data)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Backlogged,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("target", &self.target)
            .finish()
    }
}

/// Stream ID -> live logical connection, bounded by the tunnel capacity
///
/// Registration, removal and eviction all go through one lock so an ID can
/// never be admitted twice or used after it was evicted.
pub struct ConnectionCache {
    capacity: usize,
    idle: IdleTimeouts,
    entries: Mutex<HashMap<u64, Arc<LogicalConnection>>>,
    // Mirrors entries.len() for lock-free capacity checks
    live: AtomicUsize,
}

impl ConnectionCache {
    pub fn new(capacity: usize, idle: IdleTimeouts) -> Self {
        Self {
            capacity,
            idle,
            entries: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Never blocks; used on the allocation hot path
    pub fn has_capacity(&self) -> bool {
        self.len() < self.capacity
    }

    pub fn register(&self, conn: Arc<LogicalConnection>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&conn.stream_id) {
            return Err(CacheError::DuplicateStream(conn.stream_id));
        }
        if entries.len() >= self.capacity {
            return Err(CacheError::Full(self.capacity));
        }
        entries.insert(conn.stream_id, conn);
        self.live.store(entries.len(), Ordering::Release);
        Ok(())
    }

    pub fn get(&self, stream_id: u64) -> Option<Arc<LogicalConnection>> {
        self.entries.lock().get(&stream_id).cloned()
    }

    /// Remove and close a connection; a second call for the same ID is a no-op
    pub fn remove(&self, stream_id: u64) -> Option<Arc<LogicalConnection>> {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.remove(&stream_id);
            self.live.store(entries.len(), Ordering::Release);
            removed
        };

        if let Some(conn) = &removed {
            conn.close();
        }
        removed
    }

    /// Close every connection, returning how many were live
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            let drained = entries.drain().map(|(_, conn)| conn).collect();
            self.live.store(0, Ordering::Release);
            drained
        };

        for conn in &drained {
            conn.close();
        }
        drained.len()
    }

    /// Liveness sweep: evict entries idle for longer than their kind's threshold
    pub fn keepalive(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<_> = {
            let mut entries = self.entries.lock();
            let stale_ids: Vec<u64> = entries
                .values()
                .filter(|conn| conn.idle_for(now) > self.idle.for_kind(conn.kind))
                .map(|conn| conn.stream_id)
                .collect();
            let stale = stale_ids
                .iter()
                .filter_map(|id| entries.remove(id))
                .collect();
            self.live.store(entries.len(), Ordering::Release);
            stale
        };

        for conn in &stale {
            tracing::debug!(
                "Evicting stale {} stream {} ({} -> {})",
                conn.kind,
                conn.stream_id,
                conn.endpoint,
                conn.target
            );
            conn.close();
        }
        stale.len()
    }
}
