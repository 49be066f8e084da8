//! Pub/sub transport over per-peer TCP connections.
//!
//! Two logical topics (`shard-work`, `shard-work-result`) fan out to every
//! connected peer. Delivery is at-least-once among connected peers with no
//! cross-publisher ordering. Each peer connection owns a drop-oldest
//! outbound queue bounded by [`MAX_OUTBOUND_QUEUED_BYTES`]; frames over
//! [`MAX_FRAME_SIZE`] are dropped by the sender.
//!
//! Ingress pipeline, in order: frame size cap (oversized), postcard decode
//! (malformed), envelope signature (unauthenticated), record-level publisher
//! id check (unauthenticated), record validation (malformed). Every failure
//! drops silently, bumps a counter, and feeds the per-connection abuse
//! limiter; a connection that keeps failing is closed. None of this bans a
//! peer — bans are reserved for verification-prompt failures.

use super::message::{Frame, SignedEnvelope, WorkRequest, WorkResult};
use super::rate_limit::IngressAbuseLimiter;
use super::registry::PeerRegistry;
use super::serde_safe::{from_bytes, to_bytes};
use super::types::{Topic, MAX_FRAME_SIZE, MAX_OUTBOUND_QUEUED_BYTES, PROTOCOL_VERSION};
use crate::crypto::{peer_id_for, Keypair};
use crate::types::{now_ms, PeerId};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Keep-alive ping interval; half the default stale window.
const PING_INTERVAL: Duration = Duration::from_secs(120);

/// Demuxed inbound records, routed by topic.
pub struct TransportChannels {
    pub work_rx: mpsc::Receiver<(PeerId, WorkRequest)>,
    pub result_rx: mpsc::Receiver<(PeerId, WorkResult)>,
}

#[derive(Debug, Default)]
pub struct TransportCounters {
    pub malformed: AtomicU64,
    pub oversized: AtomicU64,
    pub unauthenticated: AtomicU64,
    /// Shared with every connection's outbound queue.
    pub dropped_overflow: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct TransportStats {
    pub connected: usize,
    pub malformed: u64,
    pub oversized: u64,
    pub unauthenticated: u64,
    pub dropped_overflow: u64,
}

/// Drop-oldest outbound queue, drained by the connection's writer task.
struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    closed: AtomicBool,
    dropped: Arc<AtomicU64>,
}

struct QueueInner {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
}

impl OutboundQueue {
    fn new(dropped: Arc<AtomicU64>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                bytes: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped,
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        while inner.bytes + frame.len() > MAX_OUTBOUND_QUEUED_BYTES {
            match inner.frames.pop_front() {
                Some(old) => {
                    inner.bytes -= old.len();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        inner.bytes += frame.len();
        inner.frames.push_back(frame);
        drop(inner);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.frames.pop_front() {
                    inner.bytes -= frame.len();
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct ConnHandle {
    addr: SocketAddr,
    queue: Arc<OutboundQueue>,
}

/// Outstanding keep-alive ping per peer.
#[derive(Default)]
struct PingState {
    pending: Option<u64>,
}

pub struct Transport {
    keypair: Arc<Keypair>,
    self_id: PeerId,
    listen_port: u16,
    handshake_timeout: Duration,
    conns: Mutex<HashMap<PeerId, ConnHandle>>,
    registry: Arc<PeerRegistry>,
    work_tx: mpsc::Sender<(PeerId, WorkRequest)>,
    result_tx: mpsc::Sender<(PeerId, WorkResult)>,
    counters: TransportCounters,
}

impl Transport {
    pub fn new(
        keypair: Arc<Keypair>,
        registry: Arc<PeerRegistry>,
        listen_port: u16,
        handshake_timeout: Duration,
    ) -> (Arc<Self>, TransportChannels) {
        let (work_tx, work_rx) = mpsc::channel(256);
        let (result_tx, result_rx) = mpsc::channel(256);
        let self_id = keypair.peer_id();
        let transport = Arc::new(Self {
            keypair,
            self_id,
            listen_port,
            handshake_timeout,
            conns: Mutex::new(HashMap::new()),
            registry,
            work_tx,
            result_tx,
            counters: TransportCounters::default(),
        });
        (transport, TransportChannels { work_rx, result_rx })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Bind the listener and start accepting. Returns the bound address
    /// (useful when the configured port is 0).
    pub async fn start(self: &Arc<Self>) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        let local = listener.local_addr()?;
        info!("listening on {}", local);

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        trace!("inbound connection from {}", addr);
                        let t = transport.clone();
                        tokio::spawn(async move {
                            if let Err(e) = t.run_connection(stream).await {
                                debug!("connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial a peer and run the connection to completion in a background task.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) {
        let transport = self.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = transport.run_connection(stream).await {
                        debug!("connection to {} ended: {}", addr, e);
                    }
                }
                Err(e) => debug!("dial {} failed: {}", addr, e),
            }
        });
    }

    pub fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.conns.lock().unwrap().values().any(|c| c.addr == *addr)
    }

    pub fn connected_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Seal a record into an envelope and fan it out to every connected
    /// peer not in `exclude`. Returns the number of peers targeted.
    pub fn publish<T: serde::Serialize>(
        &self,
        topic: Topic,
        record: &T,
        exclude: &[PeerId],
    ) -> usize {
        let payload = match to_bytes(record) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode {} record: {}", topic, e);
                return 0;
            }
        };
        let envelope = SignedEnvelope::seal(topic, payload, &self.keypair);
        let frame = match to_bytes(&Frame::Publish { topic, envelope }) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to encode publish frame: {}", e);
                return 0;
            }
        };
        if frame.len() > MAX_FRAME_SIZE {
            // Sender-side cap: never put an oversized frame on the wire.
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let conns = self.conns.lock().unwrap();
        let mut sent = 0;
        for (peer_id, conn) in conns.iter() {
            if exclude.contains(peer_id) {
                continue;
            }
            conn.queue.push(frame.clone());
            sent += 1;
        }
        sent
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            connected: self.connected_count(),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
            unauthenticated: self.counters.unauthenticated.load(Ordering::Relaxed),
            dropped_overflow: self.counters.dropped_overflow.load(Ordering::Relaxed),
        }
    }

    /// Drop a peer's connection (used after a registry prune).
    pub fn disconnect(&self, peer_id: &PeerId) {
        if let Some(conn) = self.conns.lock().unwrap().remove(peer_id) {
            conn.queue.close();
        }
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true).ok();
        let peer_addr = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        // Identify both sides before anything else.
        let hello = Frame::Hello {
            version: PROTOCOL_VERSION,
            pubkey: super::serde_safe::BoundedBytes::new_unchecked(
                self.keypair.public_key().clone(),
            ),
            listen_port: self.listen_port,
        };
        write_frame(&mut write_half, &to_bytes(&hello).map_err(to_io)?).await?;

        let first = tokio::time::timeout(self.handshake_timeout, read_frame(&mut read_half))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "hello timed out"))??;
        let (peer_id, peer_port) = match from_bytes::<Frame>(&first) {
            Ok(Frame::Hello { version, pubkey, listen_port }) if version == PROTOCOL_VERSION => {
                (peer_id_for(&pubkey), listen_port)
            }
            _ => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hello"));
            }
        };
        if peer_id == self.self_id {
            return Err(io::Error::new(io::ErrorKind::Other, "connected to self"));
        }

        // The peer's reachable address uses its advertised listen port.
        let announced = SocketAddr::new(peer_addr.ip(), peer_port);

        let queue = Arc::new(OutboundQueue::new(self.counters.dropped_overflow.clone()));
        {
            let mut conns = self.conns.lock().unwrap();
            if conns.contains_key(&peer_id) {
                // Keep the established connection, drop the duplicate dial.
                return Ok(());
            }
            conns.insert(
                peer_id,
                ConnHandle {
                    addr: announced,
                    queue: queue.clone(),
                },
            );
        }
        self.registry.on_connect(peer_id, announced);
        info!("peer {} connected via {}", peer_id, peer_addr);

        let writer = tokio::spawn(writer_task(write_half, queue.clone()));
        let ping_state = Arc::new(Mutex::new(PingState::default()));
        let pinger = tokio::spawn(ping_task(
            self.clone(),
            peer_id,
            queue.clone(),
            ping_state.clone(),
        ));

        let result = self.read_loop(&mut read_half, peer_id, &queue, &ping_state).await;

        queue.close();
        writer.abort();
        pinger.abort();
        self.conns.lock().unwrap().remove(&peer_id);
        self.registry.on_disconnect(&peer_id);
        info!("peer {} disconnected", peer_id);
        result
    }

    async fn read_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        peer_id: PeerId,
        queue: &OutboundQueue,
        ping_state: &Mutex<PingState>,
    ) -> io::Result<()> {
        let mut abuse = IngressAbuseLimiter::new();
        loop {
            let bytes = match read_frame(read_half).await {
                Ok(b) => b,
                Err(e) => {
                    if e.kind() == io::ErrorKind::InvalidData {
                        // Oversized frame: framing can't be resynced, close.
                        self.counters.oversized.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(e);
                }
            };
            self.registry.on_activity(&peer_id);

            let frame: Frame = match from_bytes(&bytes) {
                Ok(f) => f,
                Err(_) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    if !abuse.record_bad_frame() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "too many malformed frames",
                        ));
                    }
                    continue;
                }
            };

            match frame {
                Frame::Hello { .. } => {
                    // Repeat hello carries nothing new.
                }
                Frame::Ping { sent_at_ms } => {
                    let pong = Frame::Pong {
                        echo: sent_at_ms,
                        replied_at_ms: now_ms(),
                    };
                    if let Ok(f) = to_bytes(&pong) {
                        queue.push(f);
                    }
                }
                Frame::Pong { echo, .. } => {
                    let matched = {
                        let mut state = ping_state.lock().unwrap();
                        if state.pending == Some(echo) {
                            state.pending = None;
                            true
                        } else {
                            false
                        }
                    };
                    if matched {
                        let rtt = now_ms().saturating_sub(echo);
                        self.registry.on_handshake_ok(&peer_id, rtt);
                    }
                }
                Frame::Publish { topic, envelope } => {
                    if !self.ingest_publish(peer_id, topic, envelope).await && !abuse.record_bad_frame() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "too many rejected publishes",
                        ));
                    }
                }
            }
        }
    }

    /// Returns false when the record was rejected at ingress.
    async fn ingest_publish(
        &self,
        conn_peer: PeerId,
        topic: Topic,
        envelope: SignedEnvelope,
    ) -> bool {
        let publisher = match envelope.verify(topic) {
            Ok(id) => id,
            Err(e) => {
                trace!("dropping {} from {}: {}", topic, conn_peer, e);
                self.counters.unauthenticated.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match topic {
            Topic::Work => {
                let record: WorkRequest = match from_bytes(&envelope.payload) {
                    Ok(r) => r,
                    Err(_) => {
                        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                };
                if record.publisher_id != publisher {
                    self.counters.unauthenticated.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if record.validate().is_err() {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if self.work_tx.try_send((publisher, record)).is_err() {
                    self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                }
            }
            Topic::WorkResult => {
                let record: WorkResult = match from_bytes(&envelope.payload) {
                    Ok(r) => r,
                    Err(_) => {
                        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                };
                if record.peer_id != publisher {
                    self.counters.unauthenticated.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if record.validate().is_err() {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if self.result_tx.try_send((publisher, record)).is_err() {
                    self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }
}

async fn writer_task(mut write_half: OwnedWriteHalf, queue: Arc<OutboundQueue>) {
    while let Some(frame) = queue.pop().await {
        if write_frame(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
}

/// Keep-alive: PING, watch for the PONG inside the handshake budget, then
/// idle until the next interval. The first round doubles as the handshake.
async fn ping_task(
    transport: Arc<Transport>,
    peer_id: PeerId,
    queue: Arc<OutboundQueue>,
    state: Arc<Mutex<PingState>>,
) {
    loop {
        let sent_at = now_ms();
        state.lock().unwrap().pending = Some(sent_at);
        if let Ok(f) = to_bytes(&Frame::Ping { sent_at_ms: sent_at }) {
            queue.push(f);
        }

        tokio::time::sleep(transport.handshake_timeout).await;
        {
            let mut state = state.lock().unwrap();
            if state.pending == Some(sent_at) {
                state.pending = None;
                drop(state);
                transport.registry.on_handshake_fail(&peer_id);
            }
        }

        tokio::time::sleep(PING_INTERVAL.saturating_sub(transport.handshake_timeout)).await;
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> io::Result<Vec<u8>> {
    let len = read_half.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame over size cap"));
    }
    let mut buf = vec![0u8; len];
    read_half.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    write_half.write_u32_le(frame.len() as u32).await?;
    write_half.write_all(frame).await?;
    write_half.flush().await
}

fn to_io(e: postcard::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
