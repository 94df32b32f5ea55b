//! Verifier task for the traffic loop.
//!
//! Enforces sequence continuity and content integrity on every received
//! block. Any violation, or a receive-idle stall, is fatal: the error is
//! reported and the shared connection is closed, which unwinds the other
//! loops through their next I/O.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{LoopError, Result};
use crate::streaming::channel::{BlockReceiver, Counters, ErrorSink};
use crate::streaming::connection::Connection;
use crate::streaming::protocol::{Block, TestDescriptor};

/// Verifier configuration
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Longest wait for the next block, 0 = no limit
    pub rx_timeout_ms: u32,
}

impl From<&TestDescriptor> for VerifierConfig {
    fn from(test: &TestDescriptor) -> Self {
        Self {
            rx_timeout_ms: test.rx_timeout_ms,
        }
    }
}

/// Verifier state
pub struct Verifier {
    config: VerifierConfig,
    conn: Arc<Connection>,
    counters: Arc<Counters>,
    errors: ErrorSink,
    /// Sequence number the next block must carry
    expected: u32,
}

impl Verifier {
    pub fn new(
        config: VerifierConfig,
        conn: Arc<Connection>,
        counters: Arc<Counters>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            config,
            conn,
            counters,
            errors,
            expected: 0,
        }
    }

    /// Check one block against the integrity and ordering invariants and
    /// advance the expected sequence on success.
    pub fn verify(&mut self, block: &Block) -> Result<()> {
        block.verify_hash()?;
        if block.sequence != self.expected {
            return Err(LoopError::SequenceMismatch {
                expected: self.expected,
                actual: block.sequence,
            });
        }
        self.expected += 1;
        Ok(())
    }

    /// Number of blocks accepted so far.
    pub fn verified(&self) -> u32 {
        self.expected
    }

    /// Consume blocks until the queue closes (normal completion), a block
    /// fails verification, or the idle timeout fires. Returns the number of
    /// blocks verified.
    pub async fn run(mut self, mut blocks: BlockReceiver) -> u32 {
        tracing::debug!("verifier started");
        let idle = match self.config.rx_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };

        loop {
            let next = match idle {
                Some(limit) => match tokio::time::timeout(limit, blocks.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let err = LoopError::RxTimeout {
                            timeout_ms: self.config.rx_timeout_ms,
                            since_last_rx_ms: self.counters.millis_since_last_rx(),
                            tx_count: self.counters.tx_count(),
                            rx_count: self.counters.rx_count(),
                        };
                        self.fail(err).await;
                        return self.verified();
                    }
                },
                None => blocks.recv().await,
            };

            let Some(block) = next else {
                tracing::debug!("verifier complete ({} blocks)", self.verified());
                return self.verified();
            };

            if let Err(err) = self.verify(&block) {
                self.fail(err).await;
                return self.verified();
            }
        }
    }

    async fn fail(&self, err: LoopError) {
        tracing::error!("{}", err);
        self.errors.report(err);
        self.conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{error_channel, verifier_channel};
    use crate::streaming::protocol::BlockType;

    fn verifier(rx_timeout_ms: u32) -> (Verifier, Arc<Connection>, tokio::sync::mpsc::Receiver<LoopError>) {
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Arc::new(Connection::new(a));
        let (errors, error_rx) = error_channel();
        let verifier = Verifier::new(
            VerifierConfig { rx_timeout_ms },
            Arc::clone(&conn),
            Arc::new(Counters::new()),
            errors,
        );
        (verifier, conn, error_rx)
    }

    fn plain(sequence: u32) -> Block {
        Block::new(sequence, BlockType::Plain, vec![sequence as u8; 32])
    }

    #[test]
    fn test_accepts_contiguous_sequence() {
        let (mut v, _, _) = verifier(0);
        for seq in 0..100 {
            v.verify(&plain(seq)).unwrap();
        }
        assert_eq!(v.verified(), 100);
    }

    #[test]
    fn test_rejects_gap_without_resync() {
        let (mut v, _, _) = verifier(0);
        for seq in 0..=5 {
            v.verify(&plain(seq)).unwrap();
        }

        let err = v.verify(&plain(7)).unwrap_err();
        assert!(matches!(
            err,
            LoopError::SequenceMismatch {
                expected: 6,
                actual: 7
            }
        ));
        // Expected counter did not jump to the observed value
        assert!(v.verify(&plain(8)).is_err());
        assert_eq!(v.verified(), 6);
    }

    #[test]
    fn test_rejects_corrupt_payload() {
        let (mut v, _, _) = verifier(0);
        let mut block = plain(0);
        block.data[0] ^= 0x01;
        assert!(matches!(
            v.verify(&block),
            Err(LoopError::HashMismatch { sequence: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_closes_connection() {
        let (v, conn, mut error_rx) = verifier(0);
        let (tx, rx) = verifier_channel();

        tx.send(plain(0)).await.unwrap();
        tx.send(plain(2)).await.unwrap();
        tx.send(plain(3)).await.unwrap();

        assert_eq!(v.run(rx).await, 1);
        assert!(conn.is_closed());
        assert!(matches!(
            error_rx.try_recv().unwrap(),
            LoopError::SequenceMismatch { .. }
        ));
        assert!(error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_timeout_is_fatal() {
        let (v, conn, mut error_rx) = verifier(50);
        let (_tx, rx) = verifier_channel();

        let started = std::time::Instant::now();
        assert_eq!(v.run(rx).await, 0);

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(conn.is_closed());
        assert!(matches!(
            error_rx.try_recv().unwrap(),
            LoopError::RxTimeout { timeout_ms: 50, .. }
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_is_normal_completion() {
        let (v, conn, mut error_rx) = verifier(50);
        let (tx, rx) = verifier_channel();
        tx.send(plain(0)).await.unwrap();
        drop(tx);

        assert_eq!(v.run(rx).await, 1);
        assert!(!conn.is_closed());
        assert!(error_rx.try_recv().is_err());
    }
}
