//! # Epidemic Broadcast
//!
//! This module floods messages over a small, self-healing set of neighbours
//! built from the output of a peer sampling service.
//!
//! ## Neighbour Sets
//!
//! | Set | Origin | Bound | Purpose |
//! |-----|--------|-------|---------|
//! | Primary | we dialed | `fanout + 1` | Main dissemination links |
//! | Secondary | they dialed us | none | Reach peers that cannot be dialed (NAT) |
//! | Backup | sampled, not connected | `backup_size` | Candidates for healing |
//!
//! A sampled peer fresher than the stalest primary takes its place; the
//! demoted primary moves to the backup list. When a primary connection
//! closes, backup candidates are dialed freshest first until one connects.
//!
//! ## Message Flow
//!
//! 1. **Publish**: mint a random 32-byte id, mark it seen, send to every neighbour
//! 2. **Receive**: unseen ids are marked, forwarded to every neighbour except
//!    the one they came from, and delivered locally
//! 3. **Duplicate**: seen ids are dropped, which stops loops in cyclic overlays
//!
//! Ids stay in the seen set for the configured TTL. Delivery is at most once
//! per id within that window and best effort otherwise.
//!
//! ## Tasks
//!
//! | Task | Events |
//! |------|--------|
//! | accept loop | inbound streams, shutdown |
//! | router | local publishes, neighbour messages, shutdown |
//! | broadcaster | encoded frames, shutdown |
//! | neighbour manager | sampled peers, inbound streams, closed connections, shutdown |
//! | per connection | one reader and one writer, each also watching shutdown |
//!
//! Writes never apply backpressure to the broadcaster: every connection has
//! a bounded frame queue and a full queue drops the frame for that neighbour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::expiring::ExpiringSet;
use crate::freshness::{BoundedFreshnessList, Freshness};
use crate::identity::{Peer, SampledPeer};
use crate::messages::{BroadcastMessage, MessageId, encode_frame, read_frame};
use crate::overflow::{self, OverflowReceiver, OverflowSender};
use crate::protocols::{
    BoxStream, CloseOutcome, Listener, PeerSource, ProtoNet, ServiceError, shutdown_requested,
};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Primary neighbours kept beyond the first one.
pub const DEFAULT_FANOUT: usize = 2;

/// How long a message id suppresses duplicates.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60);

/// Backup candidates kept for healing.
pub const DEFAULT_BACKUP_SIZE: usize = 30;

/// Undelivered messages buffered for the local consumer.
pub const DEFAULT_OUT_CAPACITY: usize = 30;

/// Deadline for dialing a neighbour.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per connection before new ones are dropped.
pub const DEFAULT_SEND_QUEUE: usize = 64;

const INPUT_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Primary neighbour target; up to `fanout + 1` primaries are kept.
    pub fanout: usize,
    /// Duplicate suppression window.
    pub message_ttl: Duration,
    /// Capacity of the local delivery relay.
    pub out_capacity: usize,
    pub dial_timeout: Duration,
    /// Per-connection frame queue.
    pub send_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            message_ttl: DEFAULT_MESSAGE_TTL,
            out_capacity: DEFAULT_OUT_CAPACITY,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

// ============================================================================
// Neighbour State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ConnId(u64);

/// Handle to a live connection. Dropping it stops both of its tasks, which
/// closes the underlying stream.
struct Connection {
    frames: mpsc::Sender<Arc<Vec<u8>>>,
    _kill: oneshot::Sender<()>,
}

struct Primary {
    conn: Connection,
    candidate: SampledPeer,
}

#[derive(Default)]
struct Neighbours {
    primary: HashMap<ConnId, Primary>,
    secondary: HashMap<ConnId, Connection>,
}

impl Neighbours {
    fn count(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    fn stalest_primary(&self) -> Option<(ConnId, i64)> {
        self.primary
            .iter()
            .min_by_key(|(_, p)| p.candidate.birthday)
            .map(|(id, p)| (*id, p.candidate.birthday))
    }

    fn has_primary(&self, peer: &Peer) -> bool {
        self.primary.values().any(|p| p.candidate.peer == *peer)
    }

    fn connections(&self) -> impl Iterator<Item = (&ConnId, &Connection)> {
        self.primary
            .iter()
            .map(|(id, p)| (id, &p.conn))
            .chain(self.secondary.iter())
    }
}

impl Freshness for SampledPeer {
    fn freshness(&self) -> i64 {
        self.birthday
    }
}

struct Inbound {
    from: ConnId,
    message: BroadcastMessage,
}

struct Outbound {
    frame: Arc<Vec<u8>>,
    /// Connection the message arrived on; it is not sent back there.
    sender: Option<ConnId>,
}

struct Shared<N: ProtoNet> {
    config: BroadcastConfig,
    net: Arc<N>,
    seen: ExpiringSet<MessageId>,
    neighbours: RwLock<Neighbours>,
    count_tx: watch::Sender<usize>,
}

impl<N: ProtoNet> Shared<N> {
    async fn publish_count(&self) {
        let count = self.neighbours.read().await.count();
        self.count_tx.send_replace(count);
    }
}

// ============================================================================
// Service Handle
// ============================================================================

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Epidemic broadcast service.
pub struct Broadcast<N: ProtoNet> {
    shared: Arc<Shared<N>>,
    running: Mutex<Option<Running>>,
    input: Mutex<Option<mpsc::Sender<String>>>,
    out_rx: Mutex<Option<OverflowReceiver<String>>>,
}

impl<N: ProtoNet> Broadcast<N> {
    pub fn new(fanout: usize, message_ttl: Duration, net: Arc<N>) -> Self {
        let config = BroadcastConfig {
            fanout,
            message_ttl,
            ..BroadcastConfig::default()
        };
        Self::with_config(config, net)
    }

    pub fn with_config(config: BroadcastConfig, net: Arc<N>) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                seen: ExpiringSet::new(config.message_ttl),
                config,
                net,
                neighbours: RwLock::new(Neighbours::default()),
                count_tx,
            }),
            running: Mutex::new(None),
            input: Mutex::new(None),
            out_rx: Mutex::new(None),
        }
    }

    /// Start the service, building neighbours from `sampler` and keeping up
    /// to `backup_size` unconnected candidates for healing.
    pub async fn start(&self, sampler: impl PeerSource, backup_size: usize) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let listener = self
            .shared
            .net
            .listen()
            .await
            .map_err(|e| ServiceError::Listen(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(EVENT_QUEUE);
        let (accepted_tx, accepted_rx) = mpsc::channel(EVENT_QUEUE);
        let (out_tx, out_rx) = overflow::channel(self.shared.config.out_capacity);

        let manager = NeighbourManager::new(self.shared.clone(), backup_size, inbound_tx, shutdown_rx.clone());

        let tasks = vec![
            tokio::spawn(accept_loop(listener, accepted_tx, shutdown_rx.clone())),
            tokio::spawn(broadcaster(self.shared.clone(), outbound_rx, shutdown_rx.clone())),
            tokio::spawn(route(
                self.shared.clone(),
                input_rx,
                inbound_rx,
                outbound_tx,
                out_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(manager.run(Box::new(sampler), accepted_rx, shutdown_rx)),
        ];

        *self.input.lock().await = Some(input_tx);
        *self.out_rx.lock().await = Some(out_rx);
        *running = Some(Running {
            shutdown: shutdown_tx,
            tasks,
        });
        info!(fanout = self.shared.config.fanout, backup_size, "broadcast started");
        Ok(())
    }

    /// Signal every task to stop, close all neighbour connections and wait
    /// for the tasks to exit. Seen message ids are forgotten.
    pub async fn stop(&self) -> CloseOutcome {
        let Some(running) = self.running.lock().await.take() else {
            return CloseOutcome::AlreadyClosed;
        };
        self.input.lock().await.take();
        running.shutdown.send_replace(true);
        for task in running.tasks {
            let _ = task.await;
        }
        self.shared.seen.clear().await;
        info!("broadcast stopped");
        CloseOutcome::Closed
    }

    /// Sink for local publishes. `None` while the service is stopped.
    pub async fn input(&self) -> Option<mpsc::Sender<String>> {
        self.input.lock().await.clone()
    }

    pub async fn publish(&self, data: impl Into<String>) -> Result<()> {
        let input = self.input().await.context("broadcast is not running")?;
        input
            .send(data.into())
            .await
            .map_err(|_| anyhow::anyhow!("broadcast router closed"))
    }

    /// Take the stream of delivered payloads. Each start creates a new
    /// stream; it can be taken once.
    pub async fn out(&self) -> Option<OverflowReceiver<String>> {
        self.out_rx.lock().await.take()
    }

    /// Latest neighbour count. Intermediate values may be skipped.
    pub fn neighbour_count(&self) -> watch::Receiver<usize> {
        self.shared.count_tx.subscribe()
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    accepted: mpsc::Sender<BoxStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            res = listener.accept() => match res {
                Ok(stream) => {
                    if accepted.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "broadcast listener stopped accepting");
                    break;
                }
            },
        }
    }
    listener.close().await;
}

async fn route<N: ProtoNet>(
    shared: Arc<Shared<N>>,
    mut input: mpsc::Receiver<String>,
    mut inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
    out: OverflowSender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            Some(data) = input.recv() => {
                let message = BroadcastMessage { id: rand::random(), data };
                shared.seen.insert(message.id).await;
                trace!(id = %hex::encode(&message.id[..8]), "publishing");
                if !forward(&outbound, &message, None).await {
                    break;
                }
            }
            Some(Inbound { from, message }) = inbound.recv() => {
                if !shared.seen.insert(message.id).await {
                    trace!(id = %hex::encode(&message.id[..8]), "duplicate dropped");
                    continue;
                }
                if !forward(&outbound, &message, Some(from)).await {
                    break;
                }
                out.push(message.data);
            }
        }
    }
    out.close();
}

/// Returns false once the broadcaster is gone.
async fn forward(outbound: &mpsc::Sender<Outbound>, message: &BroadcastMessage, sender: Option<ConnId>) -> bool {
    let frame = match encode_frame(message) {
        Ok(frame) => Arc::new(frame),
        Err(e) => {
            debug!(error = %e, "message could not be encoded");
            return true;
        }
    };
    outbound.send(Outbound { frame, sender }).await.is_ok()
}

async fn broadcaster<N: ProtoNet>(
    shared: Arc<Shared<N>>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            job = outbound.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let neighbours = shared.neighbours.read().await;
        for (id, conn) in neighbours.connections() {
            if job.sender == Some(*id) {
                continue;
            }
            if let Err(TrySendError::Full(_)) = conn.frames.try_send(job.frame.clone()) {
                trace!(conn = id.0, "send queue full, frame dropped");
            }
        }
    }
}

async fn read_loop(
    id: ConnId,
    mut reader: ReadHalf<BoxStream>,
    inbound: mpsc::Sender<Inbound>,
    closed: mpsc::UnboundedSender<ConnId>,
    mut kill: oneshot::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = &mut kill => return,
            _ = shutdown_requested(&mut shutdown) => return,
            frame = read_frame::<_, BroadcastMessage>(&mut reader) => frame,
        };
        match frame {
            Ok(Some(message)) => {
                tokio::select! {
                    _ = &mut kill => return,
                    _ = shutdown_requested(&mut shutdown) => return,
                    sent = inbound.send(Inbound { from: id, message }) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                trace!(conn = id.0, "neighbour closed the stream");
                break;
            }
            Err(e) => {
                debug!(conn = id.0, error = %e, "dropping neighbour after a bad frame");
                break;
            }
        }
    }
    let _ = closed.send(id);
}

async fn write_loop(
    id: ConnId,
    mut writer: WriteHalf<BoxStream>,
    mut frames: mpsc::Receiver<Arc<Vec<u8>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            res = writer.write_all(&frame) => {
                if let Err(e) = res {
                    debug!(conn = id.0, error = %e, "write to neighbour failed");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Neighbour Manager
// ============================================================================

struct NeighbourManager<N: ProtoNet> {
    shared: Arc<Shared<N>>,
    backup: BoundedFreshnessList<SampledPeer>,
    inbound_tx: mpsc::Sender<Inbound>,
    closed_tx: mpsc::UnboundedSender<ConnId>,
    closed_rx: mpsc::UnboundedReceiver<ConnId>,
    connections: JoinSet<()>,
    next_conn: u64,
    shutdown: watch::Receiver<bool>,
}

impl<N: ProtoNet> NeighbourManager<N> {
    fn new(
        shared: Arc<Shared<N>>,
        backup_size: usize,
        inbound_tx: mpsc::Sender<Inbound>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            backup: BoundedFreshnessList::new(backup_size),
            inbound_tx,
            closed_tx,
            closed_rx,
            connections: JoinSet::new(),
            next_conn: 0,
            shutdown,
        }
    }

    async fn run(
        mut self,
        mut sampler: Box<dyn PeerSource>,
        mut accepted: mpsc::Receiver<BoxStream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sampler_open = true;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                sampled = sampler.next_peer(), if sampler_open => match sampled {
                    Some(candidate) => self.on_sampled(candidate).await,
                    None => sampler_open = false,
                },
                Some(stream) = accepted.recv() => self.on_inbound(stream).await,
                Some(id) = self.closed_rx.recv() => self.on_closed(id).await,
                Some(_) = self.connections.join_next(), if !self.connections.is_empty() => {}
            }
        }
        self.close_all().await;
    }

    async fn on_sampled(&mut self, candidate: SampledPeer) {
        let (primaries, stalest, connected) = {
            let neighbours = self.shared.neighbours.read().await;
            (
                neighbours.primary.len(),
                neighbours.stalest_primary(),
                neighbours.has_primary(&candidate.peer),
            )
        };
        if connected {
            return;
        }

        if primaries < self.shared.config.fanout + 1 {
            if let Some(stream) = self.dial(&candidate.peer).await {
                self.attach_primary(candidate, stream).await;
            }
        } else if let Some((stalest_id, stalest_birthday)) = stalest
            && candidate.birthday > stalest_birthday
        {
            if let Some(stream) = self.dial(&candidate.peer).await {
                self.attach_primary(candidate, stream).await;
                let demoted = self.shared.neighbours.write().await.primary.remove(&stalest_id);
                if let Some(demoted) = demoted {
                    debug!(peer = %demoted.candidate.peer.id.short(), "primary neighbour demoted to backup");
                    self.backup.insert(demoted.candidate);
                }
            }
        } else {
            self.backup.insert(candidate);
        }
        self.shared.publish_count().await;
    }

    async fn on_inbound(&mut self, stream: BoxStream) {
        let (id, conn) = self.attach(stream);
        self.shared.neighbours.write().await.secondary.insert(id, conn);
        trace!(conn = id.0, "secondary neighbour connected");
        self.shared.publish_count().await;
    }

    async fn on_closed(&mut self, id: ConnId) {
        let was_primary = {
            let mut neighbours = self.shared.neighbours.write().await;
            neighbours.secondary.remove(&id);
            neighbours.primary.remove(&id).is_some()
        };

        if was_primary {
            let net = self.shared.net.clone();
            let dial_timeout = self.shared.config.dial_timeout;
            let replacement = self
                .backup
                .until_first(|candidate| {
                    let net = net.clone();
                    async move {
                        match timeout(dial_timeout, net.dial(&candidate.peer)).await {
                            Ok(Ok(stream)) => Some((candidate, stream)),
                            _ => {
                                trace!(peer = %candidate.peer.id.short(), "backup candidate unreachable");
                                None
                            }
                        }
                    }
                })
                .await;
            match replacement {
                Some((candidate, stream)) => {
                    debug!(peer = %candidate.peer.id.short(), "lost primary replaced from backup");
                    self.attach_primary(candidate, stream).await;
                }
                None => debug!("lost primary, no backup candidate reachable"),
            }
        }
        self.shared.publish_count().await;
    }

    async fn dial(&self, peer: &Peer) -> Option<BoxStream> {
        match timeout(self.shared.config.dial_timeout, self.shared.net.dial(peer)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                debug!(peer = %peer.id.short(), error = %e, "neighbour dial failed");
                None
            }
            Err(_) => {
                debug!(peer = %peer.id.short(), "neighbour dial timed out");
                None
            }
        }
    }

    async fn attach_primary(&mut self, candidate: SampledPeer, stream: BoxStream) {
        let (id, conn) = self.attach(stream);
        trace!(conn = id.0, peer = %candidate.peer.id.short(), "primary neighbour connected");
        self.shared
            .neighbours
            .write()
            .await
            .primary
            .insert(id, Primary { conn, candidate });
    }

    fn attach(&mut self, stream: BoxStream) -> (ConnId, Connection) {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;

        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::channel(self.shared.config.send_queue.max(1));
        let (kill_tx, kill_rx) = oneshot::channel();

        self.connections.spawn(read_loop(
            id,
            reader,
            self.inbound_tx.clone(),
            self.closed_tx.clone(),
            kill_rx,
            self.shutdown.clone(),
        ));
        self.connections
            .spawn(write_loop(id, writer, frames_rx, self.shutdown.clone()));

        (
            id,
            Connection {
                frames: frames_tx,
                _kill: kill_tx,
            },
        )
    }

    async fn close_all(&mut self) {
        {
            let mut neighbours = self.shared.neighbours.write().await;
            neighbours.primary.clear();
            neighbours.secondary.clear();
        }
        self.backup.clear();
        self.connections.shutdown().await;
        self.shared.count_tx.send_replace(0);
    }
}
