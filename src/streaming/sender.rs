//! Sender task (transmit loop) for the traffic loop.
//!
//! Drains blocks from the Generator, piggybacks pending latency echoes on
//! plain blocks, applies pacing and jitter, and writes each block as a frame.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::error::LoopError;
use crate::streaming::channel::{BlockReceiver, Counters, ErrorSink, LatencyReceiver};
use crate::streaming::connection::Connection;
use crate::streaming::protocol::{BlockType, TestDescriptor};

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Blocks to send before the loop ends
    pub tx_requests: u32,
    /// Minimum interval between sends (0 = unpaced)
    pub pacing_ms: u32,
    /// Random jitter added to each interval, drawn from [0, max_jitter_ms)
    pub max_jitter_ms: u32,
}

impl From<&TestDescriptor> for SenderConfig {
    fn from(test: &TestDescriptor) -> Self {
        Self {
            tx_requests: test.tx_requests,
            pacing_ms: test.tx_pacing_ms,
            max_jitter_ms: test.tx_max_jitter_ms,
        }
    }
}

// =============================================================================
// Pacing
// =============================================================================

/// Send scheduler.
///
/// The next send is due at `last + interval + jitter`. When that instant has
/// already passed the block goes out immediately and the schedule restarts
/// from now, so a loop running behind never accumulates a backlog of delay.
pub struct Pacer {
    interval: Duration,
    max_jitter_ms: u32,
    last: Option<Instant>,
    rng: StdRng,
}

impl Pacer {
    pub fn new(pacing_ms: u32, max_jitter_ms: u32) -> Self {
        Self {
            interval: Duration::from_millis(pacing_ms as u64),
            max_jitter_ms,
            last: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn is_paced(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Decide when the next send may happen, given the current instant.
    /// Returns the instant to sleep until, or `None` to send now.
    pub fn schedule(&mut self, now: Instant) -> Option<Instant> {
        if !self.is_paced() {
            return None;
        }

        let jitter = if self.max_jitter_ms > 0 {
            Duration::from_millis(self.rng.gen_range(0..self.max_jitter_ms) as u64)
        } else {
            Duration::ZERO
        };

        match self.last.map(|last| last + self.interval + jitter) {
            Some(next) if next > now => {
                self.last = Some(next);
                Some(next)
            }
            _ => {
                self.last = Some(now);
                None
            }
        }
    }

    /// Sleep until the next send is due.
    pub async fn wait(&mut self) {
        if let Some(deadline) = self.schedule(Instant::now()) {
            tokio::time::sleep_until(deadline).await;
        }
    }
}

// =============================================================================
// Transmit loop
// =============================================================================

/// Sender state
pub struct Sender {
    config: SenderConfig,
    conn: Arc<Connection>,
    counters: Arc<Counters>,
    errors: ErrorSink,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        conn: Arc<Connection>,
        counters: Arc<Counters>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            config,
            conn,
            counters,
            errors,
        }
    }

    /// Run the transmit loop until `tx_requests` blocks are sent or a send
    /// fails. Failures go to the error queue; nothing is retried.
    pub async fn run(self, mut blocks: BlockReceiver, mut latencies: LatencyReceiver) {
        tracing::debug!("transmit loop started");
        let mut pacer = Pacer::new(self.config.pacing_ms, self.config.max_jitter_ms);

        while self.counters.tx_count() < self.config.tx_requests {
            let Some(mut block) = blocks.recv().await else {
                let sent = self.counters.tx_count();
                tracing::error!("tx blocks queue closed after {} blocks", sent);
                self.errors.report(LoopError::GeneratorClosed { sent });
                return;
            };

            if block.block_type == BlockType::Plain {
                match latencies.try_recv() {
                    Ok(timestamp) => block.echo_latency(timestamp),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }

            // A closed connection ends the loop without sitting out the interval
            tokio::select! {
                biased;
                _ = self.conn.closed() => {
                    tracing::debug!("connection closed while pacing");
                    self.errors.report(LoopError::ConnectionClosed);
                    return;
                }
                _ = pacer.wait() => {}
            }

            if let Err(err) = self.conn.send(&block).await {
                tracing::error!("error sending block {} ({})", block.sequence, err);
                self.errors.report(err);
                return;
            }
            self.counters.record_tx();
        }

        tracing::info!("tx count reached ({})", self.config.tx_requests);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{error_channel, generator_channel, latency_channel};
    use crate::streaming::protocol::Block;
    use std::time::SystemTime;

    #[test]
    fn test_unpaced_never_waits() {
        let mut pacer = Pacer::new(0, 50);
        let now = Instant::now();
        for _ in 0..10 {
            assert_eq!(pacer.schedule(now), None);
        }
    }

    #[test]
    fn test_pacer_spaces_sends() {
        let mut pacer = Pacer::new(10, 0);
        let start = Instant::now();

        assert_eq!(pacer.schedule(start), None);
        assert_eq!(
            pacer.schedule(start),
            Some(start + Duration::from_millis(10))
        );
        // Still ahead of schedule: the deadline advances from the last one
        assert_eq!(
            pacer.schedule(start + Duration::from_millis(5)),
            Some(start + Duration::from_millis(20))
        );
    }

    #[test]
    fn test_pacer_catch_up_resets_schedule() {
        let mut pacer = Pacer::new(10, 0);
        let start = Instant::now();
        assert_eq!(pacer.schedule(start), None);

        // A one-time stall of 100ms: send immediately, no compounding
        let late = start + Duration::from_millis(100);
        assert_eq!(pacer.schedule(late), None);
        assert_eq!(pacer.schedule(late), Some(late + Duration::from_millis(10)));
    }

    #[test]
    fn test_pacer_jitter_bounds() {
        let mut pacer = Pacer::new(10, 5);
        let start = Instant::now();
        pacer.schedule(start);

        let mut last = start;
        for _ in 0..100 {
            let next = pacer.schedule(last).unwrap();
            let gap = next - last;
            assert!(gap >= Duration::from_millis(10));
            assert!(gap < Duration::from_millis(15));
            last = next;
        }
    }

    #[tokio::test]
    async fn test_pacing_lower_bound() {
        let mut pacer = Pacer::new(20, 0);
        let start = std::time::Instant::now();
        for _ in 0..6 {
            pacer.wait().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sender_echoes_latency_on_plain_block() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::new(a));
        let peer = Connection::new(b);
        let counters = Arc::new(Counters::new());
        let (errors, mut error_rx) = error_channel();

        let (block_tx, block_rx) = generator_channel();
        let (latency_tx, latency_rx) = latency_channel();

        let echoed = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        latency_tx.try_send(echoed).unwrap();

        // The probe itself is never converted; the following plain block is
        block_tx
            .send(Block::new(0, BlockType::LatencyRequest, vec![1; 8]))
            .await
            .unwrap();
        block_tx
            .send(Block::new(1, BlockType::Plain, vec![2; 8]))
            .await
            .unwrap();
        block_tx
            .send(Block::new(2, BlockType::Plain, vec![3; 8]))
            .await
            .unwrap();

        let sender = Sender::new(
            SenderConfig {
                tx_requests: 3,
                pacing_ms: 0,
                max_jitter_ms: 0,
            },
            conn,
            Arc::clone(&counters),
            errors,
        );
        sender.run(block_rx, latency_rx).await;

        let first: Block = peer.recv().await.unwrap();
        let second: Block = peer.recv().await.unwrap();
        let third: Block = peer.recv().await.unwrap();

        assert_eq!(first.block_type, BlockType::LatencyRequest);
        assert_eq!(second.block_type, BlockType::LatencyResponse);
        assert_eq!(second.timestamp, Some(echoed));
        assert!(second.verify_hash().is_ok());
        assert_eq!(third.block_type, BlockType::Plain);

        assert_eq!(counters.tx_count(), 3);
        assert!(error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_interrupts_pacing_sleep() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::new(a));
        let peer = Connection::new(b);
        let counters = Arc::new(Counters::new());
        let (errors, mut error_rx) = error_channel();
        let (block_tx, block_rx) = generator_channel();
        let (_latency_tx, latency_rx) = latency_channel();

        for seq in 0..2 {
            block_tx
                .send(Block::new(seq, BlockType::Plain, vec![4; 8]))
                .await
                .unwrap();
        }

        let sender = Sender::new(
            SenderConfig {
                tx_requests: 2,
                pacing_ms: 10_000,
                max_jitter_ms: 0,
            },
            Arc::clone(&conn),
            Arc::clone(&counters),
            errors,
        );
        let handle = tokio::spawn(sender.run(block_rx, latency_rx));

        // First block goes out at once, the second waits out the interval
        let first: Block = peer.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        conn.close().await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sender should stop pacing once closed")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(counters.tx_count(), 1);
        assert!(matches!(
            error_rx.try_recv().unwrap(),
            LoopError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn test_sender_reports_closed_generator() {
        let (a, _b) = tokio::io::duplex(1024);
        let (errors, mut error_rx) = error_channel();
        let (block_tx, block_rx) = generator_channel();
        let (_latency_tx, latency_rx) = latency_channel();
        drop(block_tx);

        let sender = Sender::new(
            SenderConfig {
                tx_requests: 5,
                pacing_ms: 0,
                max_jitter_ms: 0,
            },
            Arc::new(Connection::new(a)),
            Arc::new(Counters::new()),
            errors,
        );
        sender.run(block_rx, latency_rx).await;

        assert!(matches!(
            error_rx.try_recv().unwrap(),
            LoopError::GeneratorClosed { sent: 0 }
        ));
    }
}
