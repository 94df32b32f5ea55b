//! Error types for the traffic loop engine.
//!
//! Every failure the engine can observe is fatal to the run that hit it. There
//! is no retryable variant: the underlying stream is reliable and ordered, so
//! a gap, a corrupted frame or a stalled peer all mean the measurement is void.

use std::io;

use thiserror::Error;

use crate::streaming::pipeline::SessionState;

pub type Result<T> = std::result::Result<T, LoopError>;

#[derive(Debug, Error)]
pub enum LoopError {
    // Framing
    #[error("bad header. got {got:02x?}, expected {expected:02x?}")]
    BadHeader { got: [u8; 4], expected: [u8; 4] },

    #[error("frame length {len} exceeds maximum allowed size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("short read: stream ended while reading {0}")]
    ShortRead(&'static str),

    #[error("short write: stream accepted no more bytes while writing {0}")]
    ShortWrite(&'static str),

    #[error("failed to read {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to write frame: {0}")]
    Write(#[source] io::Error),

    // Message schema
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: bincode::Error,
    },

    // Integrity
    #[error("mismatched hashes on block {sequence}: carried {carried}, computed {computed}")]
    HashMismatch {
        sequence: u32,
        carried: String,
        computed: String,
    },

    #[error("expected sequence [{expected}] got sequence [{actual}]")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error(
        "rx timeout exceeded ({timeout_ms} ms). last rx: {since_last_rx_ms:?} ms ago. \
         tx count: {tx_count}, rx count: {rx_count}"
    )]
    RxTimeout {
        timeout_ms: u32,
        since_last_rx_ms: Option<u64>,
        tx_count: u32,
        rx_count: u32,
    },

    // Coordination
    #[error("connection closed")]
    ConnectionClosed,

    #[error("block generator closed after {sent} blocks were sent")]
    GeneratorClosed { sent: u32 },

    #[error("session is {state:?}, a run requires Idle")]
    InvalidState { state: SessionState },

    #[error("peer reported failure: {0}")]
    PeerFailed(String),

    #[error("loop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    // Configuration
    #[error("invalid test '{name}': {reason}")]
    InvalidTest { name: String, reason: String },

    #[error("conflicting options: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LoopError {
    /// True for errors raised by the verifier's integrity checks.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            LoopError::HashMismatch { .. } | LoopError::SequenceMismatch { .. }
        )
    }

    /// True for errors raised while reading or writing frames.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            LoopError::BadHeader { .. }
                | LoopError::FrameTooLarge { .. }
                | LoopError::ShortRead(_)
                | LoopError::ShortWrite(_)
                | LoopError::Read { .. }
                | LoopError::Write(_)
        )
    }
}
