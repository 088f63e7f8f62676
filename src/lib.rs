//! # Meshcast - Gossip Overlay Library
//!
//! Meshcast builds an unstructured peer-to-peer overlay and floods messages
//! across it:
//!
//! - **Peer sampling**: Cyclon shuffles keep a small, continuously refreshed
//!   random view of live nodes
//! - **Broadcast**: epidemic flooding over a self-healing neighbour set fed
//!   by the sampler, with TTL-bounded duplicate suppression
//! - **Ring**: membership selection by modular distance, for structured
//!   neighbourhoods on top of the same peers
//! - **Gateway**: TCP listeners that route each stream to its protocol
//!
//! ## Architecture
//!
//! Every service owns its state behind one async lock and runs a handful of
//! tasks, each a `select!` over its event sources and a shared shutdown
//! signal. Services talk to the network only through [`ProtoNet`], so the
//! same code runs over TCP ([`Gateway`]) or in memory ([`MemorySwarm`]).
//!
//! Outputs that must never block a producer are overflow relays: bounded
//! queues that drop their oldest entry when full.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining gateway, sampling, broadcast and topics |
//! | `identity` | Peer ids, peer records, sampled peers |
//! | `cyclon` | Cyclon peer sampling service |
//! | `broadcast` | Epidemic broadcast with primary/secondary/backup neighbours |
//! | `ring` | Ring topology membership selector |
//! | `gateway` | TCP transport with per-protocol routing |
//! | `memory` | In-process transport for tests and simulations |
//! | `protocols` | Trait seams (`ProtoNet`, `Listener`, `PeerSource`) |
//! | `messages` | Wire types and length-prefixed bincode framing |
//! | `overflow` | Drop-oldest relay channel |
//! | `expiring` | TTL set for duplicate suppression |
//! | `freshness` | Bounded list ordered by freshness |

mod broadcast;
mod cyclon;
mod expiring;
mod freshness;
mod gateway;
mod identity;
mod memory;
mod messages;
mod node;
mod overflow;
mod protocols;
mod ring;

pub use broadcast::{
    Broadcast, BroadcastConfig, DEFAULT_BACKUP_SIZE, DEFAULT_FANOUT, DEFAULT_MESSAGE_TTL,
};
pub use cyclon::{
    Cyclon, CyclonConfig, DEFAULT_CACHE_SIZE, DEFAULT_SHUFFLE_INTERVAL, DEFAULT_SHUFFLE_LENGTH,
};
pub use expiring::ExpiringSet;
pub use freshness::{BoundedFreshnessList, Freshness};
pub use gateway::{BindError, BindReport, Gateway, GatewayProtoNet};
pub use identity::{Peer, PeerId, SampledPeer};
pub use memory::{MemoryProtoNet, MemorySwarm};
pub use messages::{BroadcastMessage, MAX_FRAME_SIZE, PeerProfile};
pub use node::{BROADCAST_PROTOCOL, CYCLON_PROTOCOL, Message, Node, NodeConfig};
pub use overflow::{OverflowReceiver, OverflowSender, channel as overflow_channel};
pub use protocols::{BoxStream, CloseOutcome, Listener, PeerSource, ProtoNet, ServiceError, Stream};
pub use ring::{ModCompare, Ring, RingNetwork};
