//! # TCP Gateway
//!
//! The gateway owns a node's TCP listeners and hands every inbound connection
//! to the protocol it asks for. Overlay services never see TCP directly; each
//! one gets a [`GatewayProtoNet`] bound to its protocol name.
//!
//! ## Stream Handshake
//!
//! Every TCP connection carries exactly one protocol conversation:
//!
//! ```text
//! dialer                                   listener
//!   | -- u16 BE length | protocol name -->  |
//!   | <-------- 1 byte: accepted / unsupported
//!   | ======== protocol frames =========== |
//! ```
//!
//! A dial for a protocol nobody registered on the far side fails instead of
//! producing a stream that goes nowhere.
//!
//! ## Binding
//!
//! [`Gateway::listen_all`] tries every address and only fails when none of
//! them could be bound. Partial failures are reported in the [`BindReport`].
//!
//! Closing the gateway stops its listeners and unregisters every protocol.
//! Streams already handed to a service belong to that service and stay open
//! until it closes them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::identity::Peer;
use crate::protocols::{BoxStream, CloseOutcome, Listener, ProtoNet, shutdown_requested};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Deadline for establishing a TCP connection to one address.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the protocol header exchange, in either direction.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest protocol name accepted in a header.
pub const MAX_PROTOCOL_LEN: usize = 256;

const PROTOCOL_ACCEPTED: u8 = 0x01;
const PROTOCOL_UNSUPPORTED: u8 = 0x00;

/// Streams queued per protocol before the handshake task waits.
const ACCEPT_BACKLOG: usize = 64;

// ============================================================================
// Bind Results
// ============================================================================

/// Addresses bound by [`Gateway::listen_all`], plus the ones that failed.
#[derive(Debug, Clone, Default)]
pub struct BindReport {
    pub bound: Vec<SocketAddr>,
    /// `(requested address, error)` for every address that failed.
    pub failures: Vec<(String, String)>,
}

/// Returned when no address at all could be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindError {
    pub failures: Vec<(String, String)>,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "no listen addresses given");
        }
        write!(f, "could not listen on any address:")?;
        for (addr, err) in &self.failures {
            write!(f, " [{}: {}]", addr, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BindError {}

// ============================================================================
// Gateway
// ============================================================================

type Routes = HashMap<String, (u64, mpsc::Sender<BoxStream>)>;

struct GatewayInner {
    routes: Mutex<Routes>,
    next_route: AtomicU64,
    local_addrs: Mutex<Vec<SocketAddr>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    connect_timeout: Duration,
}

impl GatewayInner {
    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, protocol: &str) -> Option<mpsc::Sender<BoxStream>> {
        self.routes().get(protocol).map(|(_, tx)| tx.clone())
    }

    fn unregister(&self, protocol: &str, token: u64) {
        let mut routes = self.routes();
        if routes.get(protocol).is_some_and(|(t, _)| *t == token) {
            routes.remove(protocol);
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(GatewayInner {
                routes: Mutex::new(HashMap::new()),
                next_route: AtomicU64::new(0),
                local_addrs: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                shutdown,
                closed: AtomicBool::new(false),
                connect_timeout,
            }),
        }
    }

    /// Bind every address in `addrs`.
    ///
    /// Succeeds when at least one address was bound; the report lists the
    /// addresses that failed and why.
    pub async fn listen_all<I, S>(&self, addrs: I) -> Result<BindReport, BindError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BindReport::default();

        for requested in addrs {
            let requested = requested.as_ref();
            if self.inner.closed.load(Ordering::Acquire) {
                report.failures.push((requested.to_string(), "gateway is closed".to_string()));
                continue;
            }
            let addr: SocketAddr = match requested.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    report.failures.push((requested.to_string(), e.to_string()));
                    continue;
                }
            };
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    report.failures.push((requested.to_string(), e.to_string()));
                    continue;
                }
            };
            let local = match listener.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    report.failures.push((requested.to_string(), e.to_string()));
                    continue;
                }
            };

            info!(addr = %local, "gateway listening");
            self.lock_local_addrs().push(local);
            report.bound.push(local);

            let task = tokio::spawn(accept_loop(
                listener,
                self.inner.clone(),
                self.inner.shutdown.subscribe(),
            ));
            self.inner
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(task);
        }

        for (addr, err) in &report.failures {
            warn!(addr = %addr, error = %err, "gateway failed to listen");
        }

        if report.bound.is_empty() {
            Err(BindError {
                failures: report.failures,
            })
        } else {
            Ok(report)
        }
    }

    /// Addresses the gateway is listening on.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.lock_local_addrs().clone()
    }

    /// A [`ProtoNet`] speaking `protocol` through this gateway.
    pub fn proto_net(&self, protocol: impl Into<String>) -> GatewayProtoNet {
        GatewayProtoNet {
            gateway: self.clone(),
            protocol: protocol.into(),
        }
    }

    /// Stop every listener and unregister all protocols.
    pub async fn close(&self) -> CloseOutcome {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return CloseOutcome::AlreadyClosed;
        }
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<_> = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            let _ = task.await;
        }

        self.inner.routes().clear();
        self.lock_local_addrs().clear();
        info!("gateway closed");
        CloseOutcome::Closed
    }

    fn lock_local_addrs(&self) -> std::sync::MutexGuard<'_, Vec<SocketAddr>> {
        self.inner
            .local_addrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<GatewayInner>, mut shutdown: watch::Receiver<bool>) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    let inner = inner.clone();
                    handshakes.spawn(async move {
                        if let Err(e) = route_inbound(stream, &inner).await {
                            debug!(remote = %remote, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => {
                    // Usually descriptor exhaustion; keep serving.
                    warn!(error = %e, "gateway accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
    handshakes.shutdown().await;
}

async fn route_inbound(mut stream: TcpStream, inner: &GatewayInner) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let protocol = timeout(HANDSHAKE_TIMEOUT, read_protocol(&mut stream))
        .await
        .context("protocol header timed out")??;

    let Some(route) = inner.route(&protocol) else {
        timeout(HANDSHAKE_TIMEOUT, stream.write_all(&[PROTOCOL_UNSUPPORTED]))
            .await
            .context("protocol rejection timed out")??;
        anyhow::bail!("unsupported protocol {:?}", protocol);
    };

    timeout(HANDSHAKE_TIMEOUT, stream.write_all(&[PROTOCOL_ACCEPTED]))
        .await
        .context("protocol ack timed out")??;
    route
        .send(Box::new(stream))
        .await
        .map_err(|_| anyhow::anyhow!("listener for {:?} went away", protocol))?;
    trace!(protocol = %protocol, "inbound stream routed");
    Ok(())
}

async fn read_protocol(stream: &mut TcpStream) -> Result<String> {
    let len = stream.read_u16().await? as usize;
    if len == 0 || len > MAX_PROTOCOL_LEN {
        anyhow::bail!("protocol name length {} out of range", len);
    }
    let mut name = vec![0u8; len];
    stream.read_exact(&mut name).await?;
    String::from_utf8(name).context("protocol name is not utf-8")
}

fn encode_protocol(protocol: &str) -> Result<Vec<u8>> {
    let len = protocol.len();
    if len == 0 || len > MAX_PROTOCOL_LEN {
        anyhow::bail!("protocol name length {} out of range", len);
    }
    let mut header = Vec::with_capacity(2 + len);
    header.extend_from_slice(&(len as u16).to_be_bytes());
    header.extend_from_slice(protocol.as_bytes());
    Ok(header)
}

// ============================================================================
// Protocol Handle
// ============================================================================

#[derive(Clone)]
pub struct GatewayProtoNet {
    gateway: Gateway,
    protocol: String,
}

impl GatewayProtoNet {
    async fn dial_addr(&self, addr: SocketAddr, header: &[u8]) -> Result<BoxStream> {
        let mut stream = timeout(self.gateway.inner.connect_timeout, TcpStream::connect(addr))
            .await
            .context("connect timed out")??;
        let _ = stream.set_nodelay(true);

        let ack = timeout(HANDSHAKE_TIMEOUT, async {
            stream.write_all(header).await?;
            stream.read_u8().await
        })
        .await
        .context("protocol handshake timed out")??;

        match ack {
            PROTOCOL_ACCEPTED => Ok(Box::new(stream)),
            _ => anyhow::bail!("{} does not speak {}", addr, self.protocol),
        }
    }
}

#[async_trait]
impl ProtoNet for GatewayProtoNet {
    /// Try the peer's addresses in order; the first completed handshake wins.
    async fn dial(&self, peer: &Peer) -> Result<BoxStream> {
        let header = encode_protocol(&self.protocol)?;
        let mut last_err = None;

        for raw in &peer.addrs {
            let addr: SocketAddr = match raw.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    trace!(addr = %raw, error = %e, "skipping unparsable address");
                    last_err = Some(anyhow::anyhow!("invalid address {}: {}", raw, e));
                    continue;
                }
            };
            match self.dial_addr(addr, &header).await {
                Ok(stream) => {
                    trace!(peer = %peer.id.short(), addr = %addr, protocol = %self.protocol, "dialed");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(peer = %peer.id.short(), addr = %addr, error = %e, "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} has no addresses", peer.id.short())))
    }

    async fn listen(&self) -> Result<Box<dyn Listener>> {
        if self.gateway.inner.closed.load(Ordering::Acquire) {
            anyhow::bail!("gateway is closed");
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let token = self.gateway.inner.next_route.fetch_add(1, Ordering::Relaxed);
        self.gateway
            .inner
            .routes()
            .insert(self.protocol.clone(), (token, tx));
        Ok(Box::new(GatewayListener {
            inner: self.gateway.inner.clone(),
            protocol: self.protocol.clone(),
            token,
            accept_rx: rx,
            closed: false,
        }))
    }
}

pub struct GatewayListener {
    inner: Arc<GatewayInner>,
    protocol: String,
    token: u64,
    accept_rx: mpsc::Receiver<BoxStream>,
    closed: bool,
}

#[async_trait]
impl Listener for GatewayListener {
    async fn accept(&mut self) -> Result<BoxStream> {
        if self.closed {
            anyhow::bail!("listener is closed");
        }
        self.accept_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("gateway is closed"))
    }

    async fn close(&mut self) -> CloseOutcome {
        if self.closed {
            return CloseOutcome::AlreadyClosed;
        }
        self.closed = true;
        self.inner.unregister(&self.protocol, self.token);
        self.accept_rx.close();
        while self.accept_rx.try_recv().is_ok() {}
        CloseOutcome::Closed
    }
}

impl Drop for GatewayListener {
    fn drop(&mut self) {
        if !self.closed {
            self.inner.unregister(&self.protocol, self.token);
        }
    }
}
