//! Receiver task (receive loop) for the traffic loop.
//!
//! Reads framed blocks from the peer, queues latency requests for echoing,
//! measures round trips of echoed responses, and forwards every block to the
//! Verifier.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use crate::streaming::channel::{BlockSender, Counters, ErrorSink, LatencySender, LatencyStats};
use crate::streaming::connection::Connection;
use crate::streaming::protocol::{Block, BlockType};

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Blocks to receive before the loop ends
    pub rx_requests: u32,
}

/// Receiver state
pub struct Receiver {
    config: ReceiverConfig,
    conn: Arc<Connection>,
    counters: Arc<Counters>,
    errors: ErrorSink,
    latency: LatencyStats,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        conn: Arc<Connection>,
        counters: Arc<Counters>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            config,
            conn,
            counters,
            errors,
            latency: LatencyStats::new(),
        }
    }

    /// Run the receive loop until `rx_requests` blocks have arrived or a read
    /// fails. Dropping `verifier` on return closes the Verifier's queue.
    /// Returns the round-trip samples gathered from echoed probes.
    pub async fn run(mut self, verifier: BlockSender, latencies: LatencySender) -> LatencyStats {
        tracing::debug!("receive loop started");

        while self.counters.rx_count() < self.config.rx_requests {
            let block: Block = match self.conn.recv().await {
                Ok(block) => block,
                Err(err) => {
                    tracing::error!("error receiving block ({})", err);
                    self.errors.report(err);
                    return self.latency;
                }
            };

            self.handle_latency(&block, &latencies);
            self.counters.record_rx();

            if verifier.send(block).await.is_err() {
                // Verifier already failed and closed the connection
                tracing::debug!("verifier queue closed");
                return self.latency;
            }
        }

        tracing::info!("rx count reached ({})", self.config.rx_requests);
        self.latency
    }

    fn handle_latency(&mut self, block: &Block, latencies: &LatencySender) {
        match (block.block_type, block.timestamp) {
            (BlockType::LatencyRequest, Some(timestamp)) => match latencies.try_send(timestamp) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("latency channel out of room, dropping probe {}", block.sequence);
                }
                // Transmit loop finished; there is nothing left to ride on
                Err(TrySendError::Closed(_)) => {}
            },
            (BlockType::LatencyResponse, Some(timestamp)) => {
                self.latency.record_since(timestamp);
            }
            (BlockType::LatencyRequest | BlockType::LatencyResponse, None) => {
                tracing::warn!("latency block {} carries no timestamp", block.sequence);
            }
            (BlockType::Plain, _) => {}
        }
    }
}
