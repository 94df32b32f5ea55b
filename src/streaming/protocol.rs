//! Wire protocol: framing codec and message schema.
//!
//! Frame format (every message, both directions):
//!
//! ```text
//! +----------------+------------------+------------------------+
//! | magic (4)      | length (u32, LE) | payload (length bytes) |
//! | CA FE F0 0D    |                  | bincode-encoded body   |
//! +----------------+------------------+------------------------+
//! ```
//!
//! The codec is schema-agnostic: it moves opaque payloads. Message bodies
//! (test descriptor, block, result) are encoded with bincode through the
//! [`Message`] trait, which both peers share.

use std::io;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LoopError, Result};

/// Marker preceding every frame.
pub const MAGIC_HEADER: [u8; 4] = [0xCA, 0xFE, 0xF0, 0x0D];

/// Magic marker plus length prefix.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum payload length accepted on read or write (64MB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length of the BLAKE3 content hash carried by every block.
pub const HASH_LEN: usize = 32;

// =============================================================================
// Framing
// =============================================================================

/// Write one frame: magic marker, little-endian length, payload.
///
/// The frame is assembled in a single buffer so it reaches the stream in one
/// `write_all`. A writer that stops accepting bytes part way through yields
/// [`LoopError::ShortWrite`].
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(LoopError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC_HEADER);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);

    w.write_all(&buf).await.map_err(write_error)?;
    w.flush().await.map_err(write_error)?;
    Ok(())
}

/// Read one frame and return its payload.
///
/// Fails with [`LoopError::BadHeader`] if the marker does not match and with
/// [`LoopError::ShortRead`] if the stream ends anywhere inside the frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .await
        .map_err(|e| read_error(e, "magic header"))?;
    if magic != MAGIC_HEADER {
        return Err(LoopError::BadHeader {
            got: magic,
            expected: MAGIC_HEADER,
        });
    }

    let len = r
        .read_u32_le()
        .await
        .map_err(|e| read_error(e, "frame length"))? as usize;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(LoopError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| read_error(e, "frame payload"))?;

    Ok(Bytes::from(payload))
}

fn read_error(e: io::Error, what: &'static str) -> LoopError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LoopError::ShortRead(what)
    } else {
        LoopError::Read { what, source: e }
    }
}

fn write_error(e: io::Error) -> LoopError {
    if e.kind() == io::ErrorKind::WriteZero {
        LoopError::ShortWrite("frame")
    } else {
        LoopError::Write(e)
    }
}

// =============================================================================
// Message schema
// =============================================================================

/// A message body carried inside a frame.
pub trait Message: Serialize + DeserializeOwned {
    /// Name used in encode/decode errors and logs.
    const KIND: &'static str;

    fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|source| LoopError::Encode {
                what: Self::KIND,
                source,
            })
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload).map_err(|source| LoopError::Decode {
            what: Self::KIND,
            source,
        })
    }
}

// =============================================================================
// TEST descriptor
// =============================================================================

/// Parameters of one test run, negotiated once before the loops start.
///
/// Also the `[[test]]` table format of scenario files, hence the serde
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestDescriptor {
    pub name: String,
    /// Blocks this side transmits.
    pub tx_requests: u32,
    /// Blocks this side expects to receive. 0 makes the session transmit-only.
    pub rx_requests: u32,
    pub payload_min_bytes: u32,
    pub payload_max_bytes: u32,
    /// One latency probe per N transmitted blocks. 0 disables probing.
    pub latency_frequency: u32,
    /// Minimum interval between sends. 0 = unpaced.
    pub tx_pacing_ms: u32,
    /// Upper bound of random jitter added to the pacing interval.
    pub tx_max_jitter_ms: u32,
    /// Receive-idle timeout enforced by the verifier. 0 disables it.
    pub rx_timeout_ms: u32,
}

impl Default for TestDescriptor {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            tx_requests: 1000,
            rx_requests: 1000,
            payload_min_bytes: 64,
            payload_max_bytes: 256,
            latency_frequency: 0,
            tx_pacing_ms: 0,
            tx_max_jitter_ms: 0,
            rx_timeout_ms: 30_000,
        }
    }
}

impl TestDescriptor {
    /// Largest payload that still fits a frame once the block envelope is added.
    pub const MAX_PAYLOAD_BYTES: u32 = (MAX_FRAME_SIZE - 1024) as u32;

    /// Reject descriptors that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| LoopError::InvalidTest {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.payload_min_bytes > self.payload_max_bytes {
            return Err(invalid(format!(
                "payload_min_bytes ({}) exceeds payload_max_bytes ({})",
                self.payload_min_bytes, self.payload_max_bytes
            )));
        }
        if self.payload_max_bytes > Self::MAX_PAYLOAD_BYTES {
            return Err(invalid(format!(
                "payload_max_bytes ({}) exceeds frame limit ({})",
                self.payload_max_bytes,
                Self::MAX_PAYLOAD_BYTES
            )));
        }
        if self.tx_requests == 0 && self.rx_requests == 0 {
            return Err(invalid(
                "tx_requests and rx_requests are both zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The same test seen from the peer: what one side transmits, the other
    /// receives.
    pub fn mirrored(&self) -> Self {
        Self {
            tx_requests: self.rx_requests,
            rx_requests: self.tx_requests,
            ..self.clone()
        }
    }
}

impl Message for TestDescriptor {
    const KIND: &'static str = "test";
}

// =============================================================================
// BLOCK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    Plain = 0,
    LatencyRequest = 1,
    LatencyResponse = 2,
}

/// The atomic unit of test traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub sequence: u32,
    pub block_type: BlockType,
    /// Set for latency requests (generation instant) and responses (echoed).
    pub timestamp: Option<SystemTime>,
    pub data: Vec<u8>,
    pub hash: [u8; HASH_LEN],
}

impl Block {
    /// Build a block and hash its payload. Latency requests are stamped with
    /// the current wall-clock time.
    pub fn new(sequence: u32, block_type: BlockType, data: Vec<u8>) -> Self {
        let timestamp = match block_type {
            BlockType::LatencyRequest => Some(SystemTime::now()),
            _ => None,
        };
        let hash = content_hash(&data);
        Self {
            sequence,
            block_type,
            timestamp,
            data,
            hash,
        }
    }

    /// Turn a plain block into the echo of a peer's latency request. Payload
    /// and hash are untouched.
    pub fn echo_latency(&mut self, timestamp: SystemTime) {
        self.block_type = BlockType::LatencyResponse;
        self.timestamp = Some(timestamp);
    }

    /// Re-hash the payload and compare with the carried hash.
    pub fn verify_hash(&self) -> Result<()> {
        let computed = content_hash(&self.data);
        if computed != self.hash {
            return Err(LoopError::HashMismatch {
                sequence: self.sequence,
                carried: hex::encode(self.hash),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }
}

impl Message for Block {
    const KIND: &'static str = "block";
}

pub fn content_hash(data: &[u8]) -> [u8; HASH_LEN] {
    *blake3::hash(data).as_bytes()
}

// =============================================================================
// RESULT
// =============================================================================

/// Terminal outcome of a test, sent by the responder once its run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub message: Option<String>,
}

impl TestResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    pub fn from_outcome<T>(outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => Self::success(),
            Err(err) => Self::failure(err.to_string()),
        }
    }
}

impl Message for TestResult {
    const KIND: &'static str = "result";
}

// =============================================================================
// Tests
// =============================================================================
