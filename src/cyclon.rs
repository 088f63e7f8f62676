//! # Cyclon Peer Sampling
//!
//! This module implements the Cyclon membership protocol: every node keeps a
//! small cache of peer profiles and periodically swaps a random part of it
//! with the neighbour it has not heard from for the longest time. The cache
//! converges to a continuously refreshed, roughly uniform random sample of
//! live nodes.
//!
//! ## Shuffle Round
//!
//! | Step | Locked | Action |
//! |------|--------|--------|
//! | 1 | yes | Age every profile and the service clock by one |
//! | 2 | yes | Remove the oldest profile; it is the shuffle partner |
//! | 3 | yes | Sample `shuffle_length - 1` other profiles as the offer |
//! | 4 | no | Send offer + own profile to the partner, await its answer |
//! | 5 | yes | Merge the answer into the cache, replacing offered entries |
//!
//! The network exchange runs with the cache unlocked, so concurrent shuffles
//! can interleave. Peer sampling only needs eventual consistency; a partner
//! chosen from a slightly stale view is harmless.
//!
//! ## Output
//!
//! Every profile merged into the cache for the first time is also emitted on
//! [`Cyclon::out`] as a [`SampledPeer`] whose birthday is the service age
//! minus the profile's age. The output is an overflow relay sized to the
//! cache: a slow consumer loses the oldest discoveries, never the newest.
//!
//! ## References
//!
//! Voulgaris, S., Gavidia, D. & van Steen, M. (2005). "CYCLON: Inexpensive
//! Membership Management for Unstructured P2P Overlays"

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::IteratorRandom;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, trace};

use crate::identity::{Peer, PeerId, SampledPeer};
use crate::messages::{PeerProfile, ShuffleRequest, ShuffleResponse, read_frame, write_frame};
use crate::overflow::{self, OverflowReceiver, OverflowSender};
use crate::protocols::{BoxStream, CloseOutcome, Listener, ProtoNet, ServiceError, shutdown_requested};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Number of peer profiles kept in the cache.
pub const DEFAULT_CACHE_SIZE: usize = 30;

/// Number of profiles exchanged per shuffle (including our own).
pub const DEFAULT_SHUFFLE_LENGTH: usize = 10;

/// Interval between shuffles started by the ticker.
pub const DEFAULT_SHUFFLE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on one shuffle exchange, dial included.
pub const DEFAULT_SHUFFLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct CyclonConfig {
    /// Maximum number of cached profiles.
    pub cache_size: usize,
    /// Profiles sent per shuffle, our own profile included.
    pub shuffle_length: usize,
    /// Deadline for a whole exchange (dial, request, answer).
    pub shuffle_timeout: Duration,
}

impl Default for CyclonConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            shuffle_length: DEFAULT_SHUFFLE_LENGTH,
            shuffle_timeout: DEFAULT_SHUFFLE_TIMEOUT,
        }
    }
}

// ============================================================================
// Cache State
// ============================================================================

struct CacheState {
    cache: HashMap<PeerId, PeerProfile>,
    /// Incremented once per shuffle we initiate.
    service_age: i64,
    /// Present while the service is running.
    out: Option<OverflowSender<SampledPeer>>,
}

impl CacheState {
    fn pop_oldest(&mut self) -> Option<PeerProfile> {
        let id = self.cache.values().max_by_key(|p| p.age).map(|p| p.peer.id)?;
        self.cache.remove(&id)
    }

    /// Up to `n` random profiles, left in place.
    fn sample(&self, n: usize) -> Vec<PeerProfile> {
        self.cache
            .values()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), n)
    }
}

struct Shared<N: ProtoNet> {
    me: Peer,
    config: CyclonConfig,
    net: Arc<N>,
    state: Mutex<CacheState>,
}

impl<N: ProtoNet> Shared<N> {
    async fn shuffle(&self) {
        let (partner, offer) = {
            let mut state = self.state.lock().await;
            if state.cache.is_empty() {
                return;
            }

            for profile in state.cache.values_mut() {
                profile.age = profile.age.saturating_add(1);
            }
            state.service_age += 1;

            let Some(partner) = state.pop_oldest() else {
                return;
            };
            let offer = state.sample(self.config.shuffle_length.saturating_sub(1));
            (partner, offer)
        };

        let mut request = offer.clone();
        request.push(PeerProfile::new(self.me.clone(), 0));

        let answer = match self.exchange(&partner.peer, request).await {
            Ok(answer) => {
                trace!(
                    peer = %partner.peer.id.short(),
                    offered = offer.len() + 1,
                    answered = answer.len(),
                    "shuffle complete"
                );
                answer
            }
            Err(e) => {
                debug!(peer = %partner.peer.id.short(), error = %e, "shuffle failed, dropping partner");
                Vec::new()
            }
        };

        let mut state = self.state.lock().await;
        self.update(&mut state, answer, &offer);
    }

    async fn exchange(&self, peer: &Peer, offer: Vec<PeerProfile>) -> Result<Vec<PeerProfile>> {
        let round_trip = async {
            let mut stream = self.net.dial(peer).await?;
            write_frame(&mut stream, &ShuffleRequest { offer }).await?;
            let response: ShuffleResponse = read_frame(&mut stream)
                .await?
                .context("peer closed the stream without answering")?;
            Ok::<_, anyhow::Error>(response.answer)
        };
        timeout(self.config.shuffle_timeout, round_trip)
            .await
            .context("shuffle timed out")?
    }

    async fn handle_shuffle(&self, mut stream: BoxStream) -> Result<()> {
        let request: ShuffleRequest = timeout(self.config.shuffle_timeout, read_frame(&mut stream))
            .await
            .context("shuffle request timed out")??
            .context("stream closed before a shuffle request")?;

        let answer = {
            let mut state = self.state.lock().await;
            let answer = state.sample(self.config.shuffle_length);
            self.update(&mut state, request.offer, &answer);
            answer
        };

        write_frame(&mut stream, &ShuffleResponse { answer }).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Merge `new` profiles into the cache. Once the cache is full, each
    /// remaining new profile replaces an entry from `old` that is still
    /// cached, in `old` order.
    fn update(&self, state: &mut CacheState, new: Vec<PeerProfile>, old: &[PeerProfile]) {
        let mut seen = HashSet::new();
        let mut fresh: VecDeque<PeerProfile> = new
            .into_iter()
            .filter(|p| {
                p.peer.id != self.me.id
                    && !state.cache.contains_key(&p.peer.id)
                    && seen.insert(p.peer.id)
            })
            .collect();

        if let Some(out) = state.out.as_ref() {
            for profile in &fresh {
                let birthday = state.service_age - i64::from(profile.age);
                out.push(SampledPeer::new(profile.peer.clone(), birthday));
            }
        }

        while state.cache.len() < self.config.cache_size {
            let Some(profile) = fresh.pop_front() else {
                break;
            };
            state.cache.insert(profile.peer.id, profile);
        }

        for stale in old {
            if fresh.is_empty() {
                break;
            }
            if state.cache.remove(&stale.peer.id).is_some()
                && let Some(profile) = fresh.pop_front()
            {
                state.cache.insert(profile.peer.id, profile);
            }
        }
    }
}

// ============================================================================
// Service Handle
// ============================================================================

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Cyclon peer sampling service.
pub struct Cyclon<N: ProtoNet> {
    shared: Arc<Shared<N>>,
    running: Mutex<Option<Running>>,
    out_rx: Mutex<Option<OverflowReceiver<SampledPeer>>>,
}

impl<N: ProtoNet> Cyclon<N> {
    pub fn new(me: Peer, cache_size: usize, shuffle_length: usize, net: Arc<N>) -> Self {
        let config = CyclonConfig {
            cache_size,
            shuffle_length,
            ..CyclonConfig::default()
        };
        Self::with_config(me, config, net)
    }

    pub fn with_config(me: Peer, config: CyclonConfig, net: Arc<N>) -> Self {
        Self {
            shared: Arc::new(Shared {
                me,
                config,
                net,
                state: Mutex::new(CacheState {
                    cache: HashMap::new(),
                    service_age: 0,
                    out: None,
                }),
            }),
            running: Mutex::new(None),
            out_rx: Mutex::new(None),
        }
    }

    pub fn me(&self) -> &Peer {
        &self.shared.me
    }

    /// Seed the cache with bootstrap peers at age 0. No network activity.
    ///
    /// Our own id is ignored. When the cache is full, the oldest profile
    /// makes room for each new one.
    pub async fn add(&self, peers: impl IntoIterator<Item = Peer>) {
        let mut state = self.shared.state.lock().await;
        for peer in peers {
            if peer.id == self.shared.me.id {
                continue;
            }
            if !state.cache.contains_key(&peer.id)
                && state.cache.len() >= self.shared.config.cache_size
            {
                state.pop_oldest();
            }
            state.cache.insert(peer.id, PeerProfile::new(peer, 0));
        }
    }

    /// Start answering shuffles and, if `interval` is non-zero, initiate one
    /// every `interval`. The first ticker shuffle happens one interval after
    /// start.
    pub async fn start(&self, interval: Duration) -> Result<(), ServiceError> {
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

        let (out_tx, out_rx) = overflow::channel(self.shared.config.cache_size);
        self.shared.state.lock().await.out = Some(out_tx);
        *self.out_rx.lock().await = Some(out_rx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(serve(
            self.shared.clone(),
            listener,
            shutdown_rx.clone(),
        ))];
        if !interval.is_zero() {
            tasks.push(tokio::spawn(tick(self.shared.clone(), interval, shutdown_rx)));
        }

        *running = Some(Running {
            shutdown: shutdown_tx,
            tasks,
        });
        info!(
            peer = %self.shared.me.id.short(),
            interval_ms = interval.as_millis() as u64,
            "cyclon started"
        );
        Ok(())
    }

    /// Stop the server and ticker and close the output. A shuffle already
    /// in flight finishes (bounded by the shuffle timeout) before this
    /// returns.
    pub async fn stop(&self) -> CloseOutcome {
        let Some(running) = self.running.lock().await.take() else {
            return CloseOutcome::AlreadyClosed;
        };
        running.shutdown.send_replace(true);
        for task in running.tasks {
            let _ = task.await;
        }
        if let Some(out) = self.shared.state.lock().await.out.take() {
            out.close();
        }
        info!(peer = %self.shared.me.id.short(), "cyclon stopped");
        CloseOutcome::Closed
    }

    /// Take the stream of newly discovered peers. Each start creates a new
    /// stream; it can be taken once.
    pub async fn out(&self) -> Option<OverflowReceiver<SampledPeer>> {
        self.out_rx.lock().await.take()
    }

    /// Run one shuffle round with the oldest cached peer.
    pub async fn shuffle(&self) {
        self.shared.shuffle().await;
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Peers currently cached, in no particular order.
    pub async fn peers(&self) -> Vec<Peer> {
        let state = self.shared.state.lock().await;
        state.cache.values().map(|p| p.peer.clone()).collect()
    }
}

async fn serve<N: ProtoNet>(
    shared: Arc<Shared<N>>,
    mut listener: Box<dyn Listener>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let shared = shared.clone();
                    handlers.spawn(async move {
                        if let Err(e) = shared.handle_shuffle(stream).await {
                            debug!(error = %e, "inbound shuffle failed");
                        }
                    });
                }
                Err(e) => {
                    debug!(error = %e, "cyclon listener stopped accepting");
                    break;
                }
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
    listener.close().await;
    handlers.shutdown().await;
}

async fn tick<N: ProtoNet>(shared: Arc<Shared<N>>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => shared.shuffle().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryProtoNet, MemorySwarm};

    fn id(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn peer(n: u8) -> Peer {
        Peer::unaddressed(id(n))
    }

    fn node(swarm: &MemorySwarm, n: u8, cache_size: usize, shuffle_length: usize) -> Cyclon<MemoryProtoNet> {
        Cyclon::new(peer(n), cache_size, shuffle_length, Arc::new(swarm.proto_net(id(n))))
    }

    async fn set_cache(c: &Cyclon<MemoryProtoNet>, entries: &[(u8, u32)]) {
        let mut state = c.shared.state.lock().await;
        state.cache = entries
            .iter()
            .map(|&(n, age)| (id(n), PeerProfile::new(peer(n), age)))
            .collect();
    }

    async fn cached(c: &Cyclon<MemoryProtoNet>) -> HashMap<u8, u32> {
        let state = c.shared.state.lock().await;
        state
            .cache
            .values()
            .map(|p| (p.peer.id.as_bytes()[0], p.age))
            .collect()
    }

    fn keys(map: &HashMap<u8, u32>) -> HashSet<u8> {
        map.keys().copied().collect()
    }

    async fn wait_for_baseline(base: usize) -> usize {
        let metrics = tokio::runtime::Handle::current().metrics();
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let alive = metrics.num_alive_tasks();
            if alive == base || Instant::now() >= deadline {
                return alive;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn stop_leaves_no_tasks_behind() {
        let base = tokio::runtime::Handle::current().metrics().num_alive_tasks();

        let swarm = MemorySwarm::new();
        let c = node(&swarm, 0, 20, 10);
        c.start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(c.stop().await, CloseOutcome::Closed);

        assert_eq!(wait_for_baseline(base).await, base, "cyclon tasks are leaking");
    }

    #[tokio::test]
    async fn double_start_and_stop_are_reported() {
        let swarm = MemorySwarm::new();
        let c = node(&swarm, 0, 20, 10);

        c.start(Duration::ZERO).await.unwrap();
        assert_eq!(c.start(Duration::ZERO).await, Err(ServiceError::AlreadyRunning));

        assert_eq!(c.stop().await, CloseOutcome::Closed);
        assert_eq!(c.stop().await, CloseOutcome::AlreadyClosed);

        c.start(Duration::ZERO).await.unwrap();
        assert!(c.out().await.is_some());
        assert!(c.out().await.is_none());
        c.stop().await;
    }

    #[tokio::test]
    async fn unreachable_partner_is_dropped() {
        let swarm = MemorySwarm::new();
        let c = node(&swarm, 0, 20, 10);

        c.add([peer(1)]).await;
        c.shuffle().await;

        assert!(c.is_empty().await);
    }

    #[tokio::test]
    async fn oldest_peer_is_selected() {
        let swarm = MemorySwarm::new();
        let c = node(&swarm, 0, 20, 10);
        set_cache(&c, &[(1, 2), (2, 4), (3, 3)]).await;

        c.shuffle().await;

        assert_eq!(keys(&cached(&c).await), HashSet::from([1, 3]));
    }

    #[tokio::test]
    async fn partner_learns_about_initiator() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 20, 10);
        let c1 = node(&swarm, 1, 20, 10);

        c0.add([peer(1)]).await;
        c1.start(Duration::ZERO).await.unwrap();
        let mut out = c1.out().await.unwrap();

        c0.shuffle().await;

        let sampled = tokio::time::timeout(Duration::from_secs(1), out.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(sampled.peer.id, id(0));
        c1.stop().await;
    }

    #[tokio::test]
    async fn shuffle_conserves_profiles() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 5, 3);
        let c1 = node(&swarm, 1, 5, 3);
        set_cache(&c0, &[(2, 2), (3, 2), (4, 2), (5, 2), (6, 2)]).await;
        set_cache(&c1, &[(0, 3), (7, 2), (8, 2), (9, 2), (10, 2)]).await;

        c0.start(Duration::ZERO).await.unwrap();
        c1.shuffle().await;

        // p0 is the shuffle partner and leaves c1's cache; p1 enters c0's
        // cache as the initiator. Every other profile survives somewhere.
        let mut union = keys(&cached(&c0).await);
        union.extend(keys(&cached(&c1).await));
        assert_eq!(union, (1..=10).collect::<HashSet<u8>>());
        c0.stop().await;
    }

    #[tokio::test]
    async fn ages_travel_with_profiles() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 3, 2);
        let c1 = node(&swarm, 1, 3, 2);
        set_cache(&c0, &[(2, 2), (3, 2), (4, 2)]).await;
        set_cache(&c1, &[(0, 3), (5, 2), (6, 2)]).await;

        c0.start(Duration::ZERO).await.unwrap();
        c1.shuffle().await;

        let mut union = cached(&c0).await;
        union.extend(cached(&c1).await);
        let expected = HashMap::from([(1, 0), (2, 2), (3, 2), (4, 2), (5, 3), (6, 3)]);
        assert_eq!(union, expected);
        c0.stop().await;
    }

    #[tokio::test]
    async fn birthdays_follow_service_age() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 3, 2);
        let c1 = node(&swarm, 1, 3, 2);

        c0.start(Duration::ZERO).await.unwrap();
        c1.start(Duration::ZERO).await.unwrap();
        let mut out = c1.out().await.unwrap();

        set_cache(&c0, &[(1, 10), (2, 0)]).await;
        set_cache(&c1, &[(0, 10)]).await;
        c0.shuffle().await;
        c1.shuffle().await;

        set_cache(&c0, &[(1, 10), (3, 0)]).await;
        c0.shuffle().await;

        let mut birthdays = HashMap::new();
        for _ in 0..3 {
            let sampled = tokio::time::timeout(Duration::from_secs(1), out.recv())
                .await
                .expect("timed out")
                .unwrap();
            birthdays.insert(sampled.peer.id.as_bytes()[0], sampled.birthday);
        }

        assert_eq!(birthdays[&3] - birthdays[&2], 1);
        c0.stop().await;
        c1.stop().await;
    }

    #[tokio::test]
    async fn cached_peers_are_not_emitted_again() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 20, 10);
        let c1 = node(&swarm, 1, 20, 10);

        set_cache(&c0, &[(1, 5), (2, 0), (3, 0)]).await;
        set_cache(&c1, &[(2, 0)]).await;
        c1.start(Duration::ZERO).await.unwrap();
        let mut out = c1.out().await.unwrap();

        c0.shuffle().await;

        let mut emitted = HashSet::new();
        while let Some(sampled) = out.try_recv() {
            assert!(emitted.insert(sampled.peer.id), "peer emitted twice");
        }
        assert!(!emitted.contains(&id(2)));
        assert!(emitted.contains(&id(0)));
        assert!(emitted.contains(&id(3)));
        c1.stop().await;
    }

    #[tokio::test]
    async fn initiator_skips_known_peers_and_itself() {
        let swarm = MemorySwarm::new();
        let c0 = node(&swarm, 0, 20, 10);
        let c1 = node(&swarm, 1, 20, 10);

        set_cache(&c0, &[(1, 5), (2, 0), (3, 0)]).await;
        // c1 answers with c0 itself, two peers c0 already knows and one new.
        set_cache(&c1, &[(0, 0), (2, 0), (3, 0), (4, 0)]).await;
        c0.start(Duration::ZERO).await.unwrap();
        c1.start(Duration::ZERO).await.unwrap();
        let mut out = c0.out().await.unwrap();

        c0.shuffle().await;

        let mut emitted = HashSet::new();
        while let Some(sampled) = out.try_recv() {
            assert!(emitted.insert(sampled.peer.id), "peer emitted twice");
        }
        assert_eq!(emitted, HashSet::from([id(4)]));
        assert_eq!(keys(&cached(&c0).await), HashSet::from([2, 3, 4]));
        c0.stop().await;
        c1.stop().await;
    }

    #[tokio::test]
    async fn cache_stays_bounded_and_excludes_self() {
        let swarm = MemorySwarm::new();
        let nodes: Vec<_> = (0..6u8).map(|n| node(&swarm, n, 3, 2)).collect();
        for (n, c) in nodes.iter().enumerate() {
            c.start(Duration::ZERO).await.unwrap();
            c.add((0..6u8).filter(|&m| m as usize != n).map(peer)).await;
            assert!(c.len().await <= 3);
        }

        for _round in 0..10 {
            for (n, c) in nodes.iter().enumerate() {
                c.shuffle().await;
                let cache = cached(c).await;
                assert!(cache.len() <= 3);
                assert!(!cache.contains_key(&(n as u8)));
            }
        }

        for c in &nodes {
            c.stop().await;
        }
    }

    #[tokio::test]
    async fn add_ignores_self() {
        let swarm = MemorySwarm::new();
        let c = node(&swarm, 0, 20, 10);
        c.add([peer(0), peer(1)]).await;
        assert_eq!(keys(&cached(&c).await), HashSet::from([1]));
    }
}
