//! Integration tests for sampling-driven broadcast.
//!
//! Each node runs a Cyclon sampler whose output feeds its Broadcast, all over
//! one in-memory swarm per protocol. These tests validate that the overlay
//! built from sampled peers delivers every message to every node once.

use std::sync::Arc;
use std::time::Duration;

use meshcast::{
    Broadcast, CloseOutcome, Cyclon, MemoryProtoNet, MemorySwarm, OverflowReceiver, Peer, PeerId,
};
use tokio::time::{Instant, sleep, timeout, timeout_at};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHUFFLE_INTERVAL: Duration = Duration::from_millis(20);
const MESSAGE_WAIT: Duration = Duration::from_millis(500);

// =============================================================================
// Helper Functions
// =============================================================================

struct Member {
    cyclon: Cyclon<MemoryProtoNet>,
    broadcast: Broadcast<MemoryProtoNet>,
    out: OverflowReceiver<String>,
}

fn id(n: usize) -> PeerId {
    let mut bytes = [0u8; 32];
    bytes[0] = n as u8 + 1;
    PeerId::from_bytes(bytes)
}

/// Start `size` members, each bootstrapped with the next one on a ring.
async fn start_overlay(size: usize, cache_size: usize, fanout: usize) -> Vec<Member> {
    let cyclon_swarm = MemorySwarm::new();
    let broadcast_swarm = MemorySwarm::new();

    let mut members = Vec::new();
    for n in 0..size {
        let cyclon = Cyclon::new(
            Peer::unaddressed(id(n)),
            cache_size,
            3,
            Arc::new(cyclon_swarm.proto_net(id(n))),
        );
        cyclon.add([Peer::unaddressed(id((n + 1) % size))]).await;

        let broadcast = Broadcast::new(
            fanout,
            Duration::from_secs(60),
            Arc::new(broadcast_swarm.proto_net(id(n))),
        );

        cyclon.start(SHUFFLE_INTERVAL).await.expect("cyclon start failed");
        let sampler = cyclon.out().await.expect("cyclon output missing");
        broadcast.start(sampler, 10).await.expect("broadcast start failed");
        let out = broadcast.out().await.expect("broadcast output missing");

        members.push(Member { cyclon, broadcast, out });
    }
    members
}

/// Wait until every member has at least `min` neighbours.
async fn wait_for_neighbours(members: &[Member], min: usize) {
    for (n, m) in members.iter().enumerate() {
        let mut count = m.broadcast.neighbour_count();
        timeout(TEST_TIMEOUT, count.wait_for(|c| *c >= min))
            .await
            .unwrap_or_else(|_| panic!("member {} never reached {} neighbours", n, min))
            .expect("neighbour count sender dropped");
    }
}

/// Freeze the overlay: stop sampling so no more neighbours are swapped.
async fn freeze(members: &[Member]) {
    for m in members {
        m.cyclon.stop().await;
    }
    sleep(Duration::from_millis(50)).await;
}

async fn drain(out: &mut OverflowReceiver<String>, wait: Duration) -> Vec<String> {
    let deadline = Instant::now() + wait;
    let mut got = Vec::new();
    while let Ok(Some(msg)) = timeout_at(deadline, out.recv()).await {
        got.push(msg);
    }
    got
}

async fn shutdown(members: &[Member]) {
    for m in members {
        m.broadcast.stop().await;
        m.cyclon.stop().await;
    }
}

// =============================================================================
// Test: one publisher reaches every member
// =============================================================================

#[tokio::test]
async fn sampled_overlay_delivers_to_everyone() {
    let mut members = start_overlay(6, 5, 2).await;
    wait_for_neighbours(&members, 3).await;
    freeze(&members).await;

    members[0]
        .broadcast
        .publish("hello overlay")
        .await
        .expect("publish failed");

    let (publisher, rest) = members.split_first_mut().expect("overlay is empty");
    for (n, m) in rest.iter_mut().enumerate() {
        let got = drain(&mut m.out, MESSAGE_WAIT).await;
        assert_eq!(got, vec!["hello overlay".to_string()], "member {} delivery", n + 1);
    }
    assert!(
        drain(&mut publisher.out, Duration::from_millis(50)).await.is_empty(),
        "publisher must not deliver its own message"
    );

    shutdown(&members).await;
}

// =============================================================================
// Test: every member publishes, every message arrives once everywhere
// =============================================================================

#[tokio::test]
async fn concurrent_publishers_deliver_exactly_once() {
    let mut members = start_overlay(6, 5, 2).await;
    wait_for_neighbours(&members, 3).await;
    freeze(&members).await;

    for (n, m) in members.iter().enumerate() {
        m.broadcast
            .publish(format!("from {}", n))
            .await
            .expect("publish failed");
    }

    for (n, m) in members.iter_mut().enumerate() {
        let mut got = drain(&mut m.out, MESSAGE_WAIT).await;
        got.sort();
        let mut expected: Vec<String> = (0..6).filter(|k| *k != n).map(|k| format!("from {}", k)).collect();
        expected.sort();
        assert_eq!(got, expected, "member {} deliveries", n);
    }

    shutdown(&members).await;
}

// =============================================================================
// Test: lifecycle through the public API
// =============================================================================

#[tokio::test]
async fn stopped_overlay_reports_closed_once() {
    let members = start_overlay(3, 5, 1).await;
    for m in &members {
        assert_eq!(m.broadcast.stop().await, CloseOutcome::Closed);
        assert_eq!(m.cyclon.stop().await, CloseOutcome::Closed);
    }
    for m in &members {
        assert_eq!(m.broadcast.stop().await, CloseOutcome::AlreadyClosed);
        assert_eq!(m.cyclon.stop().await, CloseOutcome::AlreadyClosed);
        assert!(m.broadcast.publish("too late").await.is_err());
        assert_eq!(*m.broadcast.neighbour_count().borrow(), 0);
    }
}
