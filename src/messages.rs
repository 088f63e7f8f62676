//! # Wire Protocol Messages
//!
//! This module defines the serializable records exchanged by the overlay
//! protocols and the length-prefixed framing used to carry them over a
//! byte stream.
//!
//! ## Protocol Types
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | Cyclon | `ShuffleRequest` | `ShuffleResponse` |
//! | Broadcast | stream of `BroadcastMessage` | (none) |
//!
//! ## Framing
//!
//! Every record is written as a 4-byte big-endian length followed by its
//! bincode encoding. Frames larger than `MAX_FRAME_SIZE` are rejected before
//! any buffer is allocated, and decoding goes through `deserialize_bounded()`.

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::Peer;

/// Largest frame accepted from a remote stream (256 KiB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub type MessageId = [u8; 32];

/// One broadcast record. The id is a random token minted by the publisher
/// and is the only thing used for duplicate suppression.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub data: String,
}

/// A Cyclon cache entry, also used as the shuffle wire record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerProfile {
    pub peer: Peer,
    /// Shuffle rounds since this profile was last refreshed.
    pub age: u32,
}

impl PeerProfile {
    pub fn new(peer: Peer, age: u32) -> Self {
        Self { peer, age }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShuffleRequest {
    pub offer: Vec<PeerProfile>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShuffleResponse {
    pub answer: Vec<PeerProfile>,
}

/// Encode `value` as a complete frame (length prefix included).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serialize_bounded(value).context("failed to encode frame")?;
    let len = u32::try_from(body.len()).context("frame length overflows u32")?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. A stream
/// that ends inside a frame, an oversized length, or an undecodable body is
/// an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("stream ended inside a frame")?;
    let value = deserialize_bounded(&body).context("failed to decode frame")?;
    Ok(Some(value))
}
