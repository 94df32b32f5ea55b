//! Channel types and shared counters for the traffic loop.
//!
//! Data path: Generator -> Sender -> wire -> Receiver -> Verifier.
//! Latency echo: Receiver -> Sender, riding on outbound plain blocks.
//! All queues are bounded.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::LoopError;
use crate::streaming::protocol::Block;

/// Channel size for Generator -> Sender
pub const GENERATOR_CHANNEL_SIZE: usize = 1024;

/// Channel size for Receiver -> Verifier
pub const VERIFIER_CHANNEL_SIZE: usize = 64;

/// Pending latency timestamps, sized to absorb probe bursts
pub const LATENCY_CHANNEL_SIZE: usize = 1024;

/// Error queue; generous so concurrent failures are never lost
pub const ERROR_CHANNEL_SIZE: usize = 10240;

// =============================================================================
// Block queues
// =============================================================================

pub type BlockSender = mpsc::Sender<Block>;
pub type BlockReceiver = mpsc::Receiver<Block>;

/// Bounded queue for Generator -> Sender. A full queue stalls the generator.
pub fn generator_channel() -> (BlockSender, BlockReceiver) {
    mpsc::channel(GENERATOR_CHANNEL_SIZE)
}

/// Bounded queue for Receiver -> Verifier.
pub fn verifier_channel() -> (BlockSender, BlockReceiver) {
    mpsc::channel(VERIFIER_CHANNEL_SIZE)
}

// =============================================================================
// Latency queue
// =============================================================================

pub type LatencySender = mpsc::Sender<SystemTime>;
pub type LatencyReceiver = mpsc::Receiver<SystemTime>;

/// Timestamps of received latency requests waiting to be echoed.
/// Producers use `try_send`, the Sender polls with `try_recv`.
pub fn latency_channel() -> (LatencySender, LatencyReceiver) {
    mpsc::channel(LATENCY_CHANNEL_SIZE)
}

// =============================================================================
// Error queue
// =============================================================================

/// Producer side of the shared error queue. Cheap to clone, one per loop.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<LoopError>,
}

impl ErrorSink {
    pub fn report(&self, err: LoopError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!("error queue full, dropping: {}", err);
            }
            // Coordinator is gone; nobody is waiting for the outcome
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

pub fn error_channel() -> (ErrorSink, mpsc::Receiver<LoopError>) {
    let (tx, rx) = mpsc::channel(ERROR_CHANNEL_SIZE);
    (ErrorSink { tx }, rx)
}

// =============================================================================
// Counters
// =============================================================================

/// Progress counters shared between the loops.
///
/// Each counter has exactly one writer (tx: Sender, rx and last_rx: Receiver);
/// the verifier's timeout report and the progress reporter only read.
#[derive(Debug, Default)]
pub struct Counters {
    tx_count: AtomicU32,
    rx_count: AtomicU32,
    /// Unix time in ms of the last received block, 0 before the first one
    last_rx_ms: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tx(&self) {
        self.tx_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self) {
        self.rx_count.fetch_add(1, Ordering::Relaxed);
        self.last_rx_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count.load(Ordering::Relaxed)
    }

    pub fn rx_count(&self) -> u32 {
        self.rx_count.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last received block, `None` if nothing arrived yet.
    pub fn millis_since_last_rx(&self) -> Option<u64> {
        match self.last_rx_ms.load(Ordering::Relaxed) {
            0 => None,
            last => Some(now_millis().saturating_sub(last)),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Latency statistics
// =============================================================================

/// Round-trip samples collected from echoed latency probes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    pub samples: u32,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub total: Duration,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the round trip of a probe sent at `sent`.
    pub fn record_since(&mut self, sent: SystemTime) {
        // Clock stepped backwards; count it as zero rather than dropping it
        let rtt = SystemTime::now().duration_since(sent).unwrap_or_default();
        self.record(rtt);
    }

    pub fn record(&mut self, rtt: Duration) {
        self.samples += 1;
        self.total += rtt;
        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples == 0 {
            None
        } else {
            Some(self.total / self.samples)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
