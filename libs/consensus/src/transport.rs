//! Point-to-point message delivery between nodes
//!
//! Transports are allowed to drop, delay, duplicate and reorder messages, but
//! never corrupt them. The protocol tolerates all of that through retries and
//! idempotent handling, so `send` is fire-and-forget and never blocks the
//! node's event loop.

use crate::config::RaftConfig;
use crate::node::RaftNode;
use crate::rpc::Envelope;
use crate::types::NodeId;
use crate::{RaftError, Result};
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Outbound half of a transport, as used by a node
pub trait Transport: Send + Sync + 'static {
    /// Queue `envelope` for delivery to `envelope.to`. May silently drop.
    fn send(&self, envelope: Envelope);
}

type MessageFilter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[derive(Default)]
struct Faults {
    /// Directed links that currently drop everything
    blocked: HashSet<(NodeId, NodeId)>,
    /// Messages it rejects are dropped
    filter: Option<MessageFilter>,
    drop_rate: f64,
    duplicate_rate: f64,
    /// Random per-message delay, which also reorders messages
    delay: Option<(Duration, Duration)>,
}

/// In-process network connecting nodes of a simulated cluster
///
/// Supports partitions, random loss, duplication and delay so tests can
/// exercise the protocol under hostile delivery.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: DashMap<NodeId, RaftNode>,
    faults: RwLock<Faults>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The sending side for node `id`
    pub fn transport(self: &Arc<Self>, id: NodeId) -> Arc<dyn Transport> {
        Arc::new(InMemoryTransport {
            id,
            network: Arc::clone(self),
        })
    }

    /// Route messages addressed to `node` into it
    pub fn connect(&self, node: RaftNode) {
        self.nodes.insert(node.id(), node);
    }

    /// Stop routing to `id`; messages to it are dropped
    pub fn disconnect(&self, id: NodeId) {
        self.nodes.remove(&id);
    }

    /// Cut every link between the two groups, in both directions
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut faults = self.faults.write();
        for &a in left {
            for &b in right {
                faults.blocked.insert((a, b));
                faults.blocked.insert((b, a));
            }
        }
        info!(?left, ?right, "Network partitioned");
    }

    /// Cut `id` off from every other connected node
    pub fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|n| *n.key())
            .filter(|&other| other != id)
            .collect();
        self.partition(&[id], &others);
    }

    /// Drop messages on the directed link `from -> to`
    pub fn block(&self, from: NodeId, to: NodeId) {
        self.faults.write().blocked.insert((from, to));
    }

    /// Restore every link
    pub fn heal(&self) {
        self.faults.write().blocked.clear();
        info!("Network healed");
    }

    /// Deliver only messages for which `keep` returns true
    pub fn set_filter(&self, keep: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        self.faults.write().filter = Some(Box::new(keep));
    }

    pub fn clear_filter(&self) {
        self.faults.write().filter = None;
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.faults.write().drop_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplicate_rate(&self, rate: f64) {
        self.faults.write().duplicate_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_delay(&self, delay: Option<(Duration, Duration)>) {
        self.faults.write().delay = delay;
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, envelope: Envelope) {
        let (copies, delay) = {
            let faults = self.faults.read();
            let filtered = faults.filter.as_ref().is_some_and(|keep| !keep(&envelope));
            if filtered || faults.blocked.contains(&(envelope.from, envelope.to)) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let mut rng = rand::thread_rng();
            if faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let copies = if faults.duplicate_rate > 0.0 && rng.gen_bool(faults.duplicate_rate) {
                2
            } else {
                1
            };
            let delay = faults.delay.map(|(min, max)| {
                if min >= max {
                    min
                } else {
                    rng.gen_range(min..=max)
                }
            });
            (copies, delay)
        };

        let Some(node) = self.nodes.get(&envelope.to).map(|n| n.value().clone()) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        for _ in 0..copies {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            match delay {
                Some(delay) => {
                    let node = node.clone();
                    let envelope = envelope.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        node.deliver(envelope);
                    });
                }
                None => node.deliver(envelope.clone()),
            }
        }
    }
}

struct InMemoryTransport {
    id: NodeId,
    network: Arc<InMemoryNetwork>,
}

impl Transport for InMemoryTransport {
    fn send(&self, envelope: Envelope) {
        debug_assert_eq!(envelope.from, self.id);
        trace!(from = %envelope.from, to = %envelope.to, kind = envelope.message.kind(), "send");
        self.network.route(envelope);
    }
}

/// Length-prefixed frame: `u32 big-endian length || bincode(envelope)`
fn encode_frame(envelope: &Envelope) -> Result<BytesMut> {
    let body = envelope.encode()?;
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame)
}

async fn read_frame(stream: &mut TcpStream, max_frame_bytes: usize) -> Result<Option<Envelope>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(RaftError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Envelope::decode(&body).map(Some)
}

/// TCP transport with one outbound connection per peer
///
/// Each peer gets a bounded queue drained by a writer task that connects,
/// writes frames, and reconnects with exponential backoff after failures.
/// A full queue drops the message. Inbound connections are accepted by
/// `serve`, which hands every decoded envelope to the local node.
pub struct TcpTransport {
    id: NodeId,
    queues: BTreeMap<NodeId, mpsc::Sender<Envelope>>,
    config: RaftConfig,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Start writer tasks for every peer in `peers` (id -> address)
    pub fn connect(
        id: NodeId,
        peers: &BTreeMap<NodeId, String>,
        config: &RaftConfig,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let mut queues = BTreeMap::new();

        for (&peer, addr) in peers {
            let (tx, rx) = mpsc::channel(config.outbound_queue_depth);
            queues.insert(peer, tx);
            tokio::spawn(peer_writer(
                id,
                peer,
                addr.clone(),
                rx,
                config.clone(),
                shutdown.clone(),
            ));
        }

        Arc::new(Self {
            id,
            queues,
            config: config.clone(),
            shutdown,
        })
    }

    /// Accept inbound connections on `listener` and deliver to `node`
    pub fn serve(&self, listener: TcpListener, node: RaftNode) {
        let shutdown = self.shutdown.clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        let id = self.id;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(node = %id, %addr, "Accepted peer connection");
                        let node = node.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            loop {
                                let frame = tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    frame = read_frame(&mut stream, max_frame_bytes) => frame,
                                };
                                match frame {
                                    Ok(Some(envelope)) if envelope.to == id => node.deliver(envelope),
                                    Ok(Some(envelope)) => {
                                        warn!(node = %id, to = %envelope.to, "Dropping misaddressed message");
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(node = %id, %addr, error = %e, "Closing peer connection");
                                        break;
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!(node = %id, error = %e, "Accept failed"),
                }
            }
        });
    }

    /// Stop all writer and listener tasks
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) {
        let Some(queue) = self.queues.get(&envelope.to) else {
            warn!(node = %self.id, to = %envelope.to, "No route to peer");
            return;
        };
        if let Err(e) = queue.try_send(envelope) {
            trace!(node = %self.id, error = %e, "Outbound queue full or closed, dropping message");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn peer_writer(
    id: NodeId,
    peer: NodeId,
    addr: String,
    mut rx: mpsc::Receiver<Envelope>,
    config: RaftConfig,
    shutdown: CancellationToken,
) {
    let mut backoff = config.reconnect_backoff_min;
    let mut stream: Option<TcpStream> = None;

    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => return,
            envelope = rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => return,
            },
        };

        if stream.is_none() {
            match TcpStream::connect(&addr).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    info!(node = %id, peer = %peer, %addr, "Connected to peer");
                    backoff = config.reconnect_backoff_min;
                    stream = Some(s);
                }
                Err(e) => {
                    debug!(node = %id, peer = %peer, error = %e, ?backoff, "Peer unreachable");
                    // The message is lost; protocol retries will resend state.
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(config.reconnect_backoff_max);
                    continue;
                }
            }
        }

        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %id, error = %e, "Failed to encode message");
                continue;
            }
        };

        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.write_all(&frame).await {
                warn!(node = %id, peer = %peer, error = %e, "Write failed, reconnecting");
                stream = None;
            }
        }
    }
}
