//! # In-Memory Protocol Network
//!
//! A [`ProtoNet`] that connects services running in the same process over
//! `tokio::io::duplex` pipes. A [`MemorySwarm`] is the shared registry for
//! one protocol: listeners register under their peer id, and dialing a peer
//! hands the far end of a fresh pipe to that peer's listener.
//!
//! Dialing a peer that has no open listener fails with "not listening",
//! which is how tests simulate unreachable or departed nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identity::{Peer, PeerId};
use crate::protocols::{BoxStream, CloseOutcome, Listener, ProtoNet};

/// Bytes buffered in each direction of an in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Streams queued for a listener before dialers wait.
const ACCEPT_BACKLOG: usize = 64;

type Registry = HashMap<PeerId, (u64, mpsc::Sender<BoxStream>)>;

#[derive(Clone, Default)]
pub struct MemorySwarm {
    listeners: Arc<Mutex<Registry>>,
    next_listener: Arc<std::sync::atomic::AtomicU64>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The network as seen by the service running as `id`.
    pub fn proto_net(&self, id: PeerId) -> MemoryProtoNet {
        MemoryProtoNet {
            swarm: self.clone(),
            id,
        }
    }

    pub fn is_listening(&self, id: &PeerId) -> bool {
        self.registry().contains_key(id)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct MemoryProtoNet {
    swarm: MemorySwarm,
    id: PeerId,
}

#[async_trait]
impl ProtoNet for MemoryProtoNet {
    async fn dial(&self, peer: &Peer) -> Result<BoxStream> {
        let accept_tx = self
            .swarm
            .registry()
            .get(&peer.id)
            .map(|(_, tx)| tx.clone());
        let Some(accept_tx) = accept_tx else {
            anyhow::bail!("{} isn't listening", peer.id.short());
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        accept_tx
            .send(Box::new(remote))
            .await
            .map_err(|_| anyhow::anyhow!("{} isn't listening", peer.id.short()))?;
        trace!(from = %self.id.short(), to = %peer.id.short(), "memory dial");
        Ok(Box::new(local))
    }

    async fn listen(&self) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let token = self
            .swarm
            .next_listener
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.swarm.registry().insert(self.id, (token, tx));
        Ok(Box::new(MemoryListener {
            swarm: self.swarm.clone(),
            id: self.id,
            token,
            accept_rx: rx,
            closed: false,
        }))
    }
}

pub struct MemoryListener {
    swarm: MemorySwarm,
    id: PeerId,
    token: u64,
    accept_rx: mpsc::Receiver<BoxStream>,
    closed: bool,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<BoxStream> {
        if self.closed {
            anyhow::bail!("listener is closed");
        }
        self.accept_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("listener is closed"))
    }

    async fn close(&mut self) -> CloseOutcome {
        if self.closed {
            return CloseOutcome::AlreadyClosed;
        }
        self.closed = true;
        {
            let mut registry = self.swarm.registry();
            // A later listen() for the same id replaces ours; leave it alone.
            if registry.get(&self.id).is_some_and(|(token, _)| *token == self.token) {
                registry.remove(&self.id);
            }
        }
        self.accept_rx.close();
        // Streams already queued are dropped so their dialers see EOF.
        while self.accept_rx.try_recv().is_ok() {}
        CloseOutcome::Closed
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        if !self.closed {
            let mut registry = self.swarm.registry();
            if registry.get(&self.id).is_some_and(|(token, _)| *token == self.token) {
                registry.remove(&self.id);
            }
        }
    }
}
