//! # Ring Topology
//!
//! Keeps up to `N` members picked from the live peers closest to self on a
//! circular id space, half on each side when enough peers are known.
//!
//! Members are kept sorted by [`ModCompare`], so the sequence is a window of
//! the circle that may wrap past zero. When a new peer overflows the window,
//! the member at the end further from self is dropped: the front when self
//! sits past the middle of the window, the back otherwise.
//!
//! The ring does not dial anything itself. It tells its [`RingNetwork`] which
//! peers became members and which stopped being members.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::identity::{Peer, PeerId};
use crate::protocols::{CloseOutcome, shutdown_requested};

/// Signed comparison on a circular id space.
///
/// `a.mod_compare(b)` is `Greater` when `a` lies within half a turn clockwise
/// of `b`, `Less` when it lies within half a turn counter-clockwise, and
/// `Equal` only for the same point.
pub trait ModCompare {
    fn mod_compare(&self, other: &Self) -> Ordering;
}

impl ModCompare for PeerId {
    /// Two's-complement difference over 2^256; the sign bit decides.
    fn mod_compare(&self, other: &Self) -> Ordering {
        let a = self.as_bytes();
        let b = other.as_bytes();
        let mut diff = [0u8; 32];
        let mut borrow = false;
        for i in (0..32).rev() {
            let (d, b1) = a[i].overflowing_sub(b[i]);
            let (d, b2) = d.overflowing_sub(borrow as u8);
            diff[i] = d;
            borrow = b1 || b2;
        }
        if diff.iter().all(|&x| x == 0) {
            Ordering::Equal
        } else if diff[0] & 0x80 != 0 {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}

impl ModCompare for Peer {
    fn mod_compare(&self, other: &Self) -> Ordering {
        self.id.mod_compare(&other.id)
    }
}

/// What the ring needs from the surrounding network.
#[async_trait]
pub trait RingNetwork<P>: Send + Sync + 'static {
    /// Peers currently believed alive.
    async fn alive_peers(&self) -> Vec<P>;

    /// Subscribe to peers becoming alive. Dropping the receiver unsubscribes.
    async fn alive_peer_notifier(&self) -> mpsc::Receiver<P>;

    async fn connect_member(&self, peer: &P);

    async fn disconnect_member(&self, peer: &P);
}

struct RingState<P, Net> {
    network: Arc<Net>,
    me: P,
    capacity: usize,
    members: Mutex<Vec<P>>,
}

enum Change<P> {
    None,
    Joined { joined: P, left: Option<P> },
}

impl<P, Net> RingState<P, Net>
where
    P: ModCompare + Clone + Send + Sync + 'static,
    Net: RingNetwork<P>,
{
    async fn consider_peer(&self, peer: P) {
        let change = {
            let mut members = self.members.lock().await;
            self.place(&mut members, peer)
        };
        if let Change::Joined { joined, left } = change {
            self.network.connect_member(&joined).await;
            if let Some(left) = left {
                self.network.disconnect_member(&left).await;
            }
        }
    }

    fn place(&self, members: &mut Vec<P>, peer: P) -> Change<P> {
        if peer.mod_compare(&self.me) == Ordering::Equal
            || members.iter().any(|m| m.mod_compare(&peer) == Ordering::Equal)
        {
            return Change::None;
        }

        let mut index = potential_index(members, &peer);
        if index == 0 && peer.mod_compare(&self.me) == Ordering::Greater {
            index = members.len();
        }
        members.insert(index, peer.clone());

        let mut evicted = None;
        if members.len() > self.capacity {
            let at = if potential_index(members, &self.me) > self.capacity / 2 {
                0
            } else {
                self.capacity
            };
            evicted = Some((at, members.remove(at)));
        }

        match evicted {
            Some((at, _)) if at == index => {
                trace!("candidate fell outside the ring window");
                Change::None
            }
            Some((_, left)) => Change::Joined {
                joined: peer,
                left: Some(left),
            },
            None => Change::Joined {
                joined: peer,
                left: None,
            },
        }
    }
}

/// Where `peer` would sit in the circularly sorted `members`.
///
/// The scan may start inside the region greater than `peer`; that run is
/// skipped before looking for the first lesser-then-greater boundary.
fn potential_index<P: ModCompare>(members: &[P], peer: &P) -> usize {
    let mut in_greater = true;
    for (i, member) in members.iter().enumerate() {
        let greater = member.mod_compare(peer) == Ordering::Greater;
        if in_greater {
            if !greater {
                in_greater = false;
            }
        } else if greater {
            return i;
        }
    }
    0
}

/// Ring membership selector.
pub struct Ring<P, Net> {
    state: Arc<RingState<P, Net>>,
    worker: std::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<P, Net> Ring<P, Net>
where
    P: ModCompare + Clone + Send + Sync + 'static,
    Net: RingNetwork<P>,
{
    /// Build a ring of at most `capacity` members around `me`.
    ///
    /// Subscribes for new peers before replaying the currently alive ones, so
    /// a peer appearing in between is considered at least once.
    pub async fn new(network: Arc<Net>, me: P, capacity: usize) -> Self {
        let mut notifier = network.alive_peer_notifier().await;
        let state = Arc::new(RingState {
            network,
            me,
            capacity,
            members: Mutex::new(Vec::with_capacity(capacity + 1)),
        });

        for peer in state.network.alive_peers().await {
            state.consider_peer(peer).await;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let worker_state = state.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    peer = notifier.recv() => match peer {
                        Some(peer) => worker_state.consider_peer(peer).await,
                        None => {
                            debug!("alive peer notifier closed");
                            break;
                        }
                    },
                }
            }
        });

        Self {
            state,
            worker: std::sync::Mutex::new(Some((shutdown_tx, worker))),
        }
    }

    pub async fn consider_peer(&self, peer: P) {
        self.state.consider_peer(peer).await;
    }

    /// Snapshot of the members in ring order.
    pub async fn members(&self) -> Vec<P> {
        self.state.members.lock().await.clone()
    }

    /// Stop following the notifier. Membership is left as it is.
    pub async fn shutdown(&self) -> CloseOutcome {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((shutdown, handle)) = worker else {
            return CloseOutcome::AlreadyClosed;
        };
        shutdown.send_replace(true);
        let _ = handle.await;
        CloseOutcome::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A point on a 100-slot ring.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Slot(u32);

    impl ModCompare for Slot {
        fn mod_compare(&self, other: &Self) -> Ordering {
            let dist = (self.0 as i64 - other.0 as i64 + 150).rem_euclid(100) - 50;
            dist.cmp(&0)
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(Slot),
        Disconnected(Slot),
    }

    struct MockNetwork {
        alive: std::sync::Mutex<Vec<Slot>>,
        subscribers: std::sync::Mutex<Vec<mpsc::Sender<Slot>>>,
        members: std::sync::Mutex<BTreeSet<Slot>>,
        events: mpsc::UnboundedSender<Event>,
    }

    impl MockNetwork {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
            let (events, rx) = mpsc::unbounded_channel();
            let net = Arc::new(Self {
                alive: std::sync::Mutex::new(Vec::new()),
                subscribers: std::sync::Mutex::new(Vec::new()),
                members: std::sync::Mutex::new(BTreeSet::new()),
                events,
            });
            (net, rx)
        }

        async fn set_alive(&self, slot: u32) {
            self.alive.lock().unwrap().push(Slot(slot));
            let subscribers = self.subscribers.lock().unwrap().clone();
            for sub in subscribers {
                let _ = sub.send(Slot(slot)).await;
            }
        }

        fn members(&self) -> Vec<u32> {
            self.members.lock().unwrap().iter().map(|s| s.0).collect()
        }
    }

    #[async_trait]
    impl RingNetwork<Slot> for MockNetwork {
        async fn alive_peers(&self) -> Vec<Slot> {
            self.alive.lock().unwrap().clone()
        }

        async fn alive_peer_notifier(&self) -> mpsc::Receiver<Slot> {
            let (tx, rx) = mpsc::channel(16);
            self.subscribers.lock().unwrap().push(tx);
            rx
        }

        async fn connect_member(&self, peer: &Slot) {
            self.members.lock().unwrap().insert(*peer);
            let _ = self.events.send(Event::Connected(*peer));
        }

        async fn disconnect_member(&self, peer: &Slot) {
            self.members.lock().unwrap().remove(peer);
            let _ = self.events.send(Event::Disconnected(*peer));
        }
    }

    /// Collect `connects` connect and `disconnects` disconnect events.
    async fn expect_events(rx: &mut mpsc::UnboundedReceiver<Event>, connects: usize, disconnects: usize) {
        let (mut c, mut d) = (0, 0);
        while c < connects || d < disconnects {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("ring never reported a membership change")
                .unwrap();
            match event {
                Event::Connected(_) => c += 1,
                Event::Disconnected(_) => d += 1,
            }
        }
        assert_eq!((c, d), (connects, disconnects));
    }

    fn slots(ring: &[Slot]) -> Vec<u32> {
        ring.iter().map(|s| s.0).collect()
    }

    #[test]
    fn peer_id_compares_across_wrap() {
        let zero = PeerId::from_bytes([0; 32]);
        let max = PeerId::from_bytes([0xff; 32]);
        let mut one = [0u8; 32];
        one[31] = 1;
        let one = PeerId::from_bytes(one);

        assert_eq!(max.mod_compare(&zero), Ordering::Less);
        assert_eq!(zero.mod_compare(&max), Ordering::Greater);
        assert_eq!(one.mod_compare(&max), Ordering::Greater);
        assert_eq!(one.mod_compare(&zero), Ordering::Greater);
        assert_eq!(zero.mod_compare(&one), Ordering::Less);
        assert_eq!(one.mod_compare(&one), Ordering::Equal);
    }

    #[test]
    fn peer_id_half_turn_is_negative() {
        let mut half = [0u8; 32];
        half[0] = 0x80;
        let half = PeerId::from_bytes(half);
        let zero = PeerId::from_bytes([0; 32]);
        assert_eq!(half.mod_compare(&zero), Ordering::Less);
    }

    #[tokio::test]
    async fn single_peer_joins() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 2).await;

        net.set_alive(40).await;
        expect_events(&mut events, 1, 0).await;
        assert_eq!(net.members(), vec![40]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_the_closest_on_both_sides() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 4).await;

        for slot in [21, 22, 23, 24, 18] {
            net.set_alive(slot).await;
        }
        expect_events(&mut events, 5, 1).await;
        assert_eq!(net.members(), vec![18, 21, 22, 23]);
        assert_eq!(slots(&ring.members().await), vec![18, 21, 22, 23]);

        net.set_alive(19).await;
        expect_events(&mut events, 1, 1).await;
        assert_eq!(net.members(), vec![18, 19, 21, 22]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn window_wraps_past_zero() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 4).await;

        for slot in [19, 21, 22, 98, 99] {
            net.set_alive(slot).await;
        }
        expect_events(&mut events, 5, 1).await;
        assert_eq!(slots(&ring.members().await), vec![99, 19, 21, 22]);
        assert_eq!(net.members(), vec![19, 21, 22, 99]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn replays_peers_alive_before_construction() {
        let (net, mut events) = MockNetwork::new();
        net.set_alive(25).await;
        net.set_alive(15).await;

        let ring = Ring::new(net.clone(), Slot(20), 4).await;
        expect_events(&mut events, 2, 0).await;
        assert_eq!(slots(&ring.members().await), vec![15, 25]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn known_peer_and_self_are_ignored() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 4).await;

        ring.consider_peer(Slot(30)).await;
        ring.consider_peer(Slot(30)).await;
        ring.consider_peer(Slot(20)).await;

        expect_events(&mut events, 1, 0).await;
        assert!(events.try_recv().is_err());
        assert_eq!(slots(&ring.members().await), vec![30]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn far_candidate_changes_nothing() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 2).await;

        ring.consider_peer(Slot(21)).await;
        ring.consider_peer(Slot(22)).await;
        expect_events(&mut events, 2, 0).await;

        ring.consider_peer(Slot(23)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(slots(&ring.members().await), vec![21, 22]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_following_notifier() {
        let (net, mut events) = MockNetwork::new();
        let ring = Ring::new(net.clone(), Slot(20), 4).await;

        assert_eq!(ring.shutdown().await, CloseOutcome::Closed);
        assert_eq!(ring.shutdown().await, CloseOutcome::AlreadyClosed);

        net.set_alive(21).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
        assert!(ring.members().await.is_empty());
    }
}
