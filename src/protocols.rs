//! Protocol trait definitions for meshcast's networking layer.
//!
//! This module defines the seams between the overlay algorithms and whatever
//! moves their bytes. Each overlay service only ever sees a [`ProtoNet`]
//! bound to its own protocol identifier.
//!
//! ## Traits
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`ProtoNet`] | `memory`, `gateway` | Per-protocol dial/listen |
//! | [`Listener`] | `memory`, `gateway` | Inbound streams for one protocol |
//! | [`PeerSource`] | overflow relay, mpsc | Feed of sampled peers for broadcast |
//!
//! ## Lifecycle results
//!
//! Starting a running service is a programming error and is reported as
//! [`ServiceError::AlreadyRunning`]. Closing something twice is benign and
//! reported as [`CloseOutcome::AlreadyClosed`].

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::identity::{Peer, SampledPeer};
use crate::overflow::OverflowReceiver;

/// A bidirectional byte stream carrying a single protocol conversation.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Virtual dial/listen for one protocol identifier.
///
/// Two instances bound to the same protocol, reachable at the addresses
/// carried by a [`Peer`], exchange bytes transparently.
#[async_trait]
pub trait ProtoNet: Send + Sync + 'static {
    async fn dial(&self, peer: &Peer) -> Result<BoxStream>;

    async fn listen(&self) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send {
    /// Next inbound stream. Fails once the listener has been closed.
    async fn accept(&mut self) -> Result<BoxStream>;

    /// Stop accepting. Idempotent.
    async fn close(&mut self) -> CloseOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// `start` was called on a service that is already running.
    AlreadyRunning,
    /// The service could not open its protocol listener.
    Listen(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::AlreadyRunning => write!(f, "service is already running"),
            ServiceError::Listen(e) => write!(f, "failed to listen: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Resolves once `shutdown` reads `true` or its sender is gone.
///
/// Returns nothing, so no `watch::Ref` outlives the call and `select!` arms
/// built on it stay `Send`.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// A stream of freshly sampled peers.
#[async_trait]
pub trait PeerSource: Send + 'static {
    /// `None` once the source is exhausted.
    async fn next_peer(&mut self) -> Option<SampledPeer>;
}

#[async_trait]
impl PeerSource for OverflowReceiver<SampledPeer> {
    async fn next_peer(&mut self) -> Option<SampledPeer> {
        self.recv().await
    }
}

#[async_trait]
impl PeerSource for mpsc::Receiver<SampledPeer> {
    async fn next_peer(&mut self) -> Option<SampledPeer> {
        self.recv().await
    }
}
