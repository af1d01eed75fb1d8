//! Gossip mesh (C3): TCP peer fabric with dedup and hop-TTL relay.
//!
//! Peers come from the service-registry collaborator. For every pair the
//! lower node id initiates the connection and announces itself; the higher
//! id accepts. Beliefs are flooded with a bounded-LRU `(origin, sequence)`
//! dedup table and a hop counter, so loops die independent of topology.
//! Socket errors trigger reconnects with exponential backoff, never state
//! invalidation.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use senseye_common::{MeshConfig, NodeId, NodeRole, Point};
use senseye_protocol::{Belief, CodecError, FrameReader, FrameWriter, WireMessage};

use crate::registry::DiscoveryEvent;
use crate::tasks::TaskMessage;

/// Commands accepted by the mesh task.
#[derive(Debug)]
pub enum MeshCommand {
    /// Flood the local belief to every connected peer.
    Broadcast(Belief),
    /// Send one message to one peer.
    SendTo {
        /// Destination peer
        peer: NodeId,
        /// Message to deliver
        message: WireMessage,
    },
}

/// Events emitted by the mesh task.
#[derive(Debug)]
pub enum MeshEvent {
    /// A fresh (non-duplicate) belief arrived.
    BeliefReceived(Belief),
    /// A peer connection was established.
    PeerConnected(NodeId),
    /// A peer connection dropped.
    PeerDisconnected(NodeId),
    /// A peer asked us to chirp.
    AcousticPing {
        /// Requesting peer
        from: NodeId,
        /// Correlation id
        request_id: u64,
        /// Delay before chirping (seconds)
        delay_s: f64,
        /// Audio sample rate (Hz)
        sample_rate: u32,
        /// Chirp start frequency (Hz)
        freq_start: u32,
        /// Chirp end frequency (Hz)
        freq_end: u32,
        /// Chirp duration (seconds)
        chirp_duration: f64,
    },
    /// A peer answered our chirp request.
    AcousticPong {
        /// Responding peer
        from: NodeId,
        /// Correlation id
        request_id: u64,
        /// Whether the chirp was played
        ok: bool,
    },
}

/// Bounded LRU table of seen `(origin, sequence_number)` pairs.
///
/// Without the bound, a buggy peer with ever-increasing sequence numbers
/// would exhaust memory. At capacity the least-recently-seen entry is
/// evicted; current inserts are never rejected.
#[derive(Debug)]
pub struct DedupTable {
    capacity: usize,
    stamps: HashMap<(NodeId, u64), u64>,
    order: VecDeque<((NodeId, u64), u64)>,
    clock: u64,
}

impl DedupTable {
    /// Creates a table bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stamps: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
        }
    }

    /// Records `(origin, sequence)`. Returns `true` when the pair is new,
    /// `false` when it was already seen (refreshing its recency).
    pub fn insert(&mut self, origin: &str, sequence: u64) -> bool {
        self.clock += 1;
        let key = (origin.to_string(), sequence);
        let fresh = !self.stamps.contains_key(&key);
        self.stamps.insert(key.clone(), self.clock);
        self.order.push_back((key, self.clock));

        if fresh {
            while self.stamps.len() > self.capacity {
                self.evict_oldest();
            }
        }
        // Repeated touches leave superseded entries in the order queue;
        // compact before it outgrows the live table by too much.
        if self.order.len() > self.capacity.saturating_mul(4) {
            let stamps = &self.stamps;
            self.order
                .retain(|(key, stamp)| stamps.get(key) == Some(stamp));
        }
        fresh
    }

    /// True when the pair has been seen.
    pub fn contains(&self, origin: &str, sequence: u64) -> bool {
        self.stamps.contains_key(&(origin.to_string(), sequence))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    fn evict_oldest(&mut self) {
        // Lazy deletion: skip order entries superseded by a newer touch.
        while let Some((key, stamp)) = self.order.pop_front() {
            match self.stamps.get(&key) {
                Some(&latest) if latest == stamp => {
                    self.stamps.remove(&key);
                    return;
                }
                _ => continue,
            }
        }
    }
}

/// Outcome of processing one received belief.
#[derive(Debug)]
pub struct RelayDecision {
    /// Deliver to the local fusion stage.
    pub deliver: Option<Belief>,
    /// Re-broadcast to all peers except the sender.
    pub forward: Option<Belief>,
}

/// Applies the dedup/relay invariant to a received belief.
///
/// Duplicates and own echoes are dropped; fresh beliefs are delivered,
/// and forwarded with a decremented hop count while hops remain.
pub fn process_belief(dedup: &mut DedupTable, own_id: &str, belief: Belief) -> RelayDecision {
    if belief.node_id == own_id {
        return RelayDecision {
            deliver: None,
            forward: None,
        };
    }
    if !dedup.insert(&belief.node_id, belief.sequence_number) {
        return RelayDecision {
            deliver: None,
            forward: None,
        };
    }
    let forward = (belief.hop_count > 0).then(|| {
        let mut forwarded = belief.clone();
        forwarded.hop_count -= 1;
        forwarded
    });
    RelayDecision {
        deliver: Some(belief),
        forward,
    }
}

/// Outbound dial timeout (seconds).
const CONNECT_TIMEOUT_S: f64 = 5.0;
/// A peer silent on the wire for this long is cut loose; heartbeats run
/// at ~1 Hz, so a minute of silence means the link is gone.
const READ_TIMEOUT_S: f64 = 60.0;

/// Drop/error counters, logged periodically.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeshCounters {
    /// Frames that failed to parse
    pub malformed_frames: u64,
    /// Connections dropped for oversize frames
    pub oversize_frames: u64,
    /// Beliefs dropped as duplicates
    pub duplicate_beliefs: u64,
    /// Beliefs re-broadcast to peers
    pub forwarded_beliefs: u64,
}

struct Peer {
    tx: mpsc::Sender<WireMessage>,
}

enum Internal {
    /// A connection finished its announce handshake. The write loop is
    /// already running; `tx` feeds it.
    Established {
        peer: NodeId,
        read: FrameReader<OwnedReadHalf>,
        tx: mpsc::Sender<WireMessage>,
    },
    /// A frame arrived from an established peer.
    Inbound { peer: NodeId, message: WireMessage },
    /// A connection closed or failed.
    Closed { peer: NodeId },
    /// An outbound dial attempt failed.
    DialFailed { peer: NodeId },
    /// A frame was dropped as malformed.
    MalformedFrame,
    /// A connection was aborted for an oversize frame.
    OversizeFrame,
}

/// Drains queued messages into the socket. Exits silently when the mesh
/// drops the sender (deliberate close) or the writer fails; peer death is
/// detected by the read loop or by the next failed send.
fn spawn_write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut write_rx: mpsc::Receiver<WireMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = write_rx.recv().await {
            if writer.write_frame(&message).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
}

/// The gossip mesh actor.
pub struct MeshTask {
    node_id: NodeId,
    role: NodeRole,
    position: Option<Point>,
    config: MeshConfig,
    peers: HashMap<NodeId, Peer>,
    discovered: HashMap<NodeId, SocketAddr>,
    dial_attempts: HashMap<NodeId, u32>,
    dedup: DedupTable,
    counters: MeshCounters,
    events_tx: mpsc::Sender<MeshEvent>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
}

impl MeshTask {
    /// Creates the mesh actor; `events_tx` feeds the pipeline task.
    pub fn new(
        node_id: NodeId,
        role: NodeRole,
        position: Option<Point>,
        config: MeshConfig,
        events_tx: mpsc::Sender<MeshEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let dedup = DedupTable::new(config.dedup_capacity);
        Self {
            node_id,
            role,
            position,
            config,
            peers: HashMap::new(),
            discovered: HashMap::new(),
            dial_attempts: HashMap::new(),
            dedup,
            counters: MeshCounters::default(),
            events_tx,
            internal_tx,
            internal_rx,
        }
    }

    /// Current drop/error counters.
    pub fn counters(&self) -> MeshCounters {
        self.counters
    }

    /// Runs the mesh loop until a shutdown message arrives.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<TaskMessage<MeshCommand>>,
        mut discovery: mpsc::Receiver<DiscoveryEvent>,
    ) {
        info!(node_id = %self.node_id, addr = ?listener.local_addr().ok(), "mesh listening");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(TaskMessage::Message(command)) => self.handle_command(command).await,
                        Some(TaskMessage::Shutdown) | None => break,
                    }
                }
                event = discovery.recv() => {
                    if let Some(event) = event {
                        self.handle_discovery(event);
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.spawn_incoming_handshake(stream, addr),
                        Err(e) => debug!("accept failed: {e}"),
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
            }
        }
        info!(node_id = %self.node_id, "mesh stopped");
    }

    async fn handle_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::Broadcast(belief) => {
                // Record our own emission so relayed echoes die on arrival.
                self.dedup.insert(&belief.node_id, belief.sequence_number);
                self.send_to_all(WireMessage::Belief(belief), None).await;
            }
            MeshCommand::SendTo { peer, message } => {
                if let Some(handle) = self.peers.get(&peer) {
                    if handle.tx.send(message).await.is_err() {
                        self.drop_peer(&peer).await;
                    }
                } else {
                    debug!(peer = %peer, "send_to: peer not connected");
                }
            }
        }
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Joined { node_id, addr } => {
                if node_id == self.node_id {
                    return;
                }
                info!(peer = %node_id, %addr, "peer discovered");
                self.discovered.insert(node_id.clone(), addr);
                // The lower id dials; the higher id waits to be dialed.
                if self.node_id < node_id && !self.peers.contains_key(&node_id) {
                    self.spawn_dial(node_id, 0);
                }
            }
            DiscoveryEvent::Left { node_id } => {
                info!(peer = %node_id, "peer withdrawn");
                self.discovered.remove(&node_id);
                self.dial_attempts.remove(&node_id);
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Established { peer, read, tx } => {
                if self.peers.contains_key(&peer) {
                    // Dropping read + tx tears the duplicate down quietly.
                    debug!(peer = %peer, "duplicate connection, keeping the first");
                    return;
                }
                self.dial_attempts.remove(&peer);
                self.peers.insert(peer.clone(), Peer { tx });
                self.spawn_read_loop(peer.clone(), read);
                info!(peer = %peer, "peer connected");
                let _ = self.events_tx.send(MeshEvent::PeerConnected(peer)).await;
            }
            Internal::Inbound { peer, message } => self.handle_inbound(peer, message).await,
            Internal::Closed { peer } => self.drop_peer(&peer).await,
            Internal::DialFailed { peer } => {
                let attempts = self.dial_attempts.entry(peer.clone()).or_insert(0);
                *attempts += 1;
                let attempts = *attempts;
                if self.discovered.contains_key(&peer) && self.node_id < peer {
                    self.spawn_dial(peer, attempts);
                }
            }
            Internal::MalformedFrame => self.counters.malformed_frames += 1,
            Internal::OversizeFrame => self.counters.oversize_frames += 1,
        }
    }

    async fn handle_inbound(&mut self, peer: NodeId, message: WireMessage) {
        match message {
            WireMessage::Belief(belief) => {
                let decision = process_belief(&mut self.dedup, &self.node_id, belief);
                if decision.deliver.is_none() {
                    self.counters.duplicate_beliefs += 1;
                }
                if let Some(belief) = decision.deliver {
                    let _ = self
                        .events_tx
                        .send(MeshEvent::BeliefReceived(belief))
                        .await;
                }
                if let Some(forwarded) = decision.forward {
                    self.counters.forwarded_beliefs += 1;
                    self.send_to_all(WireMessage::Belief(forwarded), Some(&peer))
                        .await;
                }
            }
            WireMessage::AcousticPing {
                request_id,
                delay_s,
                sample_rate,
                freq_start,
                freq_end,
                chirp_duration,
            } => {
                let _ = self
                    .events_tx
                    .send(MeshEvent::AcousticPing {
                        from: peer,
                        request_id,
                        delay_s,
                        sample_rate,
                        freq_start,
                        freq_end,
                        chirp_duration,
                    })
                    .await;
            }
            WireMessage::AcousticPong {
                request_id, ok, ..
            } => {
                let _ = self
                    .events_tx
                    .send(MeshEvent::AcousticPong {
                        from: peer,
                        request_id,
                        ok,
                    })
                    .await;
            }
            WireMessage::Announce { .. } => {
                // Repeat announces after the handshake carry nothing new.
                debug!(peer = %peer, "ignoring repeat announce");
            }
        }
    }

    async fn send_to_all(&mut self, message: WireMessage, except: Option<&str>) {
        let mut dead = Vec::new();
        for (peer, handle) in &self.peers {
            if Some(peer.as_str()) == except {
                continue;
            }
            if handle.tx.send(message.clone()).await.is_err() {
                dead.push(peer.clone());
            }
        }
        for peer in dead {
            self.drop_peer(&peer).await;
        }
    }

    async fn drop_peer(&mut self, peer: &str) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        info!(peer = %peer, "peer disconnected");
        let _ = self
            .events_tx
            .send(MeshEvent::PeerDisconnected(peer.to_string()))
            .await;
        // Client side schedules a reconnect while the peer stays registered.
        if self.discovered.contains_key(peer) && self.node_id.as_str() < peer {
            let attempts = self.dial_attempts.get(peer).copied().unwrap_or(0);
            self.spawn_dial(peer.to_string(), attempts);
        }
    }

    fn backoff_delay(&self, attempts: u32) -> f64 {
        (self.config.reconnect_base_s * 2f64.powi(attempts.min(16) as i32))
            .min(self.config.reconnect_max_s)
    }

    fn spawn_dial(&self, peer: NodeId, attempts: u32) {
        let Some(&addr) = self.discovered.get(&peer) else {
            return;
        };
        let delay = if attempts == 0 {
            0.0
        } else {
            self.backoff_delay(attempts - 1)
        };
        let internal_tx = self.internal_tx.clone();
        let announce = WireMessage::Announce {
            node_id: self.node_id.clone(),
            role: self.role,
            position: self.position.map(|p| [p.x, p.y]),
        };
        let max_frame_len = self.config.max_frame_len;
        tokio::spawn(async move {
            if delay > 0.0 {
                debug!(peer = %peer, delay, "reconnect backoff");
                tokio::time::sleep(tokio::time::Duration::from_secs_f64(delay)).await;
            }
            let connect = tokio::time::timeout(
                tokio::time::Duration::from_secs_f64(CONNECT_TIMEOUT_S),
                TcpStream::connect(addr),
            )
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            });
            match connect {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    let mut writer = FrameWriter::new(write_half);
                    if writer.write_frame(&announce).await.is_err() {
                        let _ = internal_tx.send(Internal::DialFailed { peer }).await;
                        return;
                    }
                    let (tx, write_rx) = mpsc::channel(64);
                    spawn_write_loop(writer, write_rx);
                    let read = FrameReader::new(read_half, max_frame_len);
                    let _ = internal_tx
                        .send(Internal::Established { peer, read, tx })
                        .await;
                }
                Err(e) => {
                    debug!(peer = %peer, "dial failed: {e}");
                    let _ = internal_tx.send(Internal::DialFailed { peer }).await;
                }
            }
        });
    }

    fn spawn_incoming_handshake(&self, stream: TcpStream, addr: SocketAddr) {
        let internal_tx = self.internal_tx.clone();
        let own_id = self.node_id.clone();
        let max_frame_len = self.config.max_frame_len;
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let mut read = FrameReader::new(read_half, max_frame_len);
            // First frame must identify the peer, promptly.
            let announce = tokio::time::timeout(
                tokio::time::Duration::from_secs_f64(CONNECT_TIMEOUT_S),
                read.read_frame(),
            )
            .await;
            let peer = match announce {
                Ok(Ok(Some(WireMessage::Announce { node_id, .. }))) => node_id,
                other => {
                    debug!(%addr, "handshake rejected: {other:?}");
                    return;
                }
            };
            // The dialing side must hold the lower id.
            if peer.is_empty() || peer >= own_id {
                debug!(peer = %peer, "rejecting incoming connection (dial-direction rule)");
                return;
            }
            let (tx, write_rx) = mpsc::channel(64);
            spawn_write_loop(FrameWriter::new(write_half), write_rx);
            let _ = internal_tx
                .send(Internal::Established { peer, read, tx })
                .await;
        });
    }

    /// Spawns the mesh on its own tokio task, binding the listener first.
    pub async fn spawn(
        self,
        bind_addr: SocketAddr,
        commands: mpsc::Receiver<TaskMessage<MeshCommand>>,
        discovery: mpsc::Receiver<DiscoveryEvent>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(self.run(listener, commands, discovery));
        Ok(local)
    }

    fn spawn_read_loop(&self, peer: NodeId, mut read: FrameReader<OwnedReadHalf>) {
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let read_timeout = tokio::time::Duration::from_secs_f64(READ_TIMEOUT_S);
            loop {
                let frame = match tokio::time::timeout(read_timeout, read.read_frame()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!(peer = %peer, "read timeout, closing connection");
                        break;
                    }
                };
                match frame {
                    Ok(Some(message)) => {
                        if internal_tx
                            .send(Internal::Inbound {
                                peer: peer.clone(),
                                message,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(CodecError::Malformed(e)) => {
                        debug!(peer = %peer, "malformed frame dropped: {e}");
                        let _ = internal_tx.send(Internal::MalformedFrame).await;
                        continue;
                    }
                    Err(CodecError::Oversize { len, max }) => {
                        warn!(peer = %peer, len, max, "oversize frame, aborting connection");
                        let _ = internal_tx.send(Internal::OversizeFrame).await;
                        break;
                    }
                    Err(CodecError::Io(e)) => {
                        debug!(peer = %peer, "read error: {e}");
                        break;
                    }
                }
            }
            let _ = internal_tx.send(Internal::Closed { peer }).await;
        });
    }

}
