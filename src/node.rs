//! # High-Level Node API
//!
//! A [`Node`] is one process-level participant: a TCP gateway, a Cyclon
//! sampler and an epidemic broadcast wired together, plus topic routing on
//! top of the raw broadcast payloads.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(["0.0.0.0:4001"], NodeConfig::default()).await?;
//!
//! // Seed the sampler with a known peer
//! node.bootstrap(["<hex id>@203.0.113.7:4001".parse()?]).await;
//!
//! let mut chat = node.subscribe("chat").await?;
//! node.publish("chat", "hello").await?;
//! while let Some(msg) = chat.recv().await {
//!     println!("{msg}");
//! }
//! ```
//!
//! ## Component Integration
//!
//! | Component | Protocol | Role |
//! |-----------|----------|------|
//! | Gateway | - | TCP listeners, protocol routing |
//! | Cyclon | [`CYCLON_PROTOCOL`] | Peer sampling, feeds broadcast |
//! | Broadcast | [`BROADCAST_PROTOCOL`] | Flooding over sampled neighbours |
//!
//! ## Topics
//!
//! Topics are a naming convention over the broadcast payload: publishing
//! `msg` on `topic` floods `/topic/msg`. Every node receives every topic and
//! filters locally. Payloads that do not follow the convention are dropped.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Broadcast, BroadcastConfig, DEFAULT_BACKUP_SIZE};
use crate::cyclon::{Cyclon, CyclonConfig, DEFAULT_SHUFFLE_INTERVAL};
use crate::gateway::{DEFAULT_CONNECT_TIMEOUT, Gateway, GatewayProtoNet};
use crate::identity::{Peer, PeerId};
use crate::overflow::OverflowReceiver;
use crate::protocols::CloseOutcome;

pub const CYCLON_PROTOCOL: &str = "/meshcast/cyclon/1.0.0";
pub const BROADCAST_PROTOCOL: &str = "/meshcast/broadcast/1.0.0";

/// Messages queued per subscriber before new ones are dropped.
const SUBSCRIPTION_QUEUE: usize = 256;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub cyclon: CyclonConfig,
    pub shuffle_interval: Duration,
    pub broadcast: BroadcastConfig,
    pub backup_size: usize,
    pub connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cyclon: CyclonConfig::default(),
            shuffle_interval: DEFAULT_SHUFFLE_INTERVAL,
            broadcast: BroadcastConfig::default(),
            backup_size: DEFAULT_BACKUP_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A delivered message with its topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub data: String,
}

type Subscribers = Arc<RwLock<HashMap<String, Vec<mpsc::Sender<String>>>>>;

pub struct Node {
    peer: Peer,
    gateway: Gateway,
    cyclon: Cyclon<GatewayProtoNet>,
    broadcast: Broadcast<GatewayProtoNet>,
    subscribers: Subscribers,
    messages_rx: TakeOnce<Message>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bind the gateway on `addrs`, start sampling and broadcasting.
    ///
    /// Succeeds when at least one address could be bound. The node gets a
    /// fresh random id.
    pub async fn bind<I, S>(addrs: I, config: NodeConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let gateway = Gateway::with_connect_timeout(config.connect_timeout);
        let report = gateway
            .listen_all(addrs)
            .await
            .context("failed to bind gateway")?;

        let id = PeerId::random();
        let peer = Peer::new(id, advertised_addrs(&report.bound));

        let cyclon = Cyclon::with_config(
            peer.clone(),
            config.cyclon,
            Arc::new(gateway.proto_net(CYCLON_PROTOCOL)),
        );
        let broadcast = Broadcast::with_config(
            config.broadcast,
            Arc::new(gateway.proto_net(BROADCAST_PROTOCOL)),
        );

        cyclon.start(config.shuffle_interval).await?;
        let sampler = cyclon.out().await.context("cyclon output already taken")?;
        broadcast.start(sampler, config.backup_size).await?;
        let delivered = broadcast.out().await.context("broadcast output already taken")?;

        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let (messages_tx, messages_rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        let router = tokio::spawn(route_topics(delivered, subscribers.clone(), messages_tx));

        info!(peer = %peer, "node started");

        Ok(Self {
            peer,
            gateway,
            cyclon,
            broadcast,
            subscribers,
            messages_rx: Mutex::new(Some(messages_rx)),
            router: Mutex::new(Some(router)),
        })
    }

    /// This node's id and advertised addresses.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer.id
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.gateway.local_addrs()
    }

    /// Seed the sampler with known peers. Contact happens on later shuffles.
    pub async fn bootstrap(&self, peers: impl IntoIterator<Item = Peer>) {
        let peers: Vec<Peer> = peers.into_iter().collect();
        debug!(count = peers.len(), "bootstrapping");
        self.cyclon.add(peers).await;
    }

    pub async fn publish(&self, topic: &str, data: &str) -> Result<()> {
        validate_topic(topic)?;
        self.broadcast.publish(format!("/{}/{}", topic, data)).await
    }

    /// Receive every message delivered on `topic` from now on.
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        validate_topic(topic)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Every delivered message regardless of topic. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<Message>> {
        self.messages_rx
            .lock()
            .await
            .take()
            .context("message receiver already taken")
    }

    pub fn neighbour_count(&self) -> watch::Receiver<usize> {
        self.broadcast.neighbour_count()
    }

    /// Peers currently in the sampler's cache.
    pub async fn cached_peers(&self) -> Vec<Peer> {
        self.cyclon.peers().await
    }

    /// Stop broadcasting and sampling, then close the gateway.
    pub async fn shutdown(&self) -> CloseOutcome {
        let Some(router) = self.router.lock().await.take() else {
            return CloseOutcome::AlreadyClosed;
        };
        self.broadcast.stop().await;
        self.cyclon.stop().await;
        self.gateway.close().await;
        // The router ends once the broadcast output is closed.
        let _ = router.await;
        info!(peer = %self.peer.id.short(), "node stopped");
        CloseOutcome::Closed
    }
}

async fn route_topics(
    mut delivered: OverflowReceiver<String>,
    subscribers: Subscribers,
    messages: mpsc::Sender<Message>,
) {
    while let Some(raw) = delivered.recv().await {
        let Some((topic, data)) = split_topic(&raw) else {
            debug!("dropping message without a topic");
            continue;
        };

        let mut subs = subscribers.write().await;
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|tx| match tx.try_send(data.to_string()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(topic = %topic, "subscriber lagging, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                subs.remove(topic);
            }
        }
        drop(subs);

        let _ = messages.try_send(Message {
            topic: topic.to_string(),
            data: data.to_string(),
        });
    }
}

/// Split `/topic/msg` into its parts.
fn split_topic(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix('/')?;
    let (topic, data) = rest.split_once('/')?;
    if topic.is_empty() {
        return None;
    }
    Some((topic, data))
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains('/') {
        anyhow::bail!("invalid topic {:?}: must be non-empty and contain no '/'", topic);
    }
    Ok(())
}

/// Replace unspecified bind addresses with loopback so peers on the same
/// host can dial us. Other hosts need an explicit address.
fn advertised_addrs(bound: &[SocketAddr]) -> Vec<String> {
    bound
        .iter()
        .map(|addr| {
            let ip = match addr.ip() {
                IpAddr::V4(ip) if ip.is_unspecified() => {
                    warn!(addr = %addr, "advertising loopback for unspecified address");
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                }
                IpAddr::V6(ip) if ip.is_unspecified() => {
                    warn!(addr = %addr, "advertising loopback for unspecified address");
                    IpAddr::V6(Ipv6Addr::LOCALHOST)
                }
                ip => ip,
            };
            SocketAddr::new(ip, addr.port()).to_string()
        })
        .collect()
}
