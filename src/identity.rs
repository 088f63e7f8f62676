//! # Peer Identities
//!
//! This module defines the identity types shared by every overlay component:
//!
//! - [`PeerId`]: 32-byte opaque identifier of a participant
//! - [`Peer`]: a `PeerId` plus the network addresses it can be dialed at
//! - [`SampledPeer`]: a `Peer` annotated with the birthday assigned by the
//!   peer sampling service
//!
//! ## Annotations
//!
//! Protocol annotations are carried by typed wrappers owned by the component
//! that produces them rather than by a key/value bag on `Peer`:
//!
//! | Wrapper | Owner | Annotation |
//! |---------|-------|------------|
//! | `PeerProfile` (messages) | cyclon | `age`: shuffle rounds since refresh |
//! | [`SampledPeer`] | cyclon → broadcast | `birthday`: service age at discovery |
//!
//! A `Peer` parses from and formats to `HEXID@ADDR`, which is what the CLI
//! accepts for bootstrap peers.

use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier drawn from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First 8 bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A participant in the overlay and the addresses it listens on.
///
/// Equality and hashing consider only the identifier: two records for the
/// same peer with different address lists describe the same participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl Peer {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// Peer reachable at a single address.
    pub fn single(id: PeerId, addr: impl Into<String>) -> Self {
        Self::new(id, vec![addr.into()])
    }

    /// Peer with no known address. Useful for in-memory networks keyed by id.
    pub fn unaddressed(id: PeerId) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.primary_addr() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for Peer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .context("peer must be given as HEXID@ADDR")?;
        let id = PeerId::from_hex(id_part).context("invalid hex peer id (expected 64 characters)")?;
        if addr_part.is_empty() {
            anyhow::bail!("peer address is empty");
        }
        Ok(Peer::single(id, addr_part))
    }
}

/// A peer as emitted by the sampling service.
///
/// `birthday` is the sampler's service age minus the profile's age at the
/// moment of discovery. Greater is fresher; values are only comparable when
/// they come from the same sampler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampledPeer {
    pub peer: Peer,
    pub birthday: i64,
}

impl SampledPeer {
    pub fn new(peer: Peer, birthday: i64) -> Self {
        Self { peer, birthday }
    }
}
