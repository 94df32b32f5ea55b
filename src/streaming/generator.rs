//! Generator task for the traffic loop.
//!
//! Produces the outgoing block sequence and streams it to the Sender through
//! a bounded queue, stalling whenever the Sender falls behind.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::streaming::channel::BlockSender;
use crate::streaming::protocol::{Block, BlockType, TestDescriptor};

/// Generator configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Number of blocks to produce
    pub count: u32,
    /// Smallest payload, inclusive
    pub payload_min: u32,
    /// Largest payload, inclusive
    pub payload_max: u32,
    /// One latency request every N blocks (0 = none)
    pub latency_frequency: u32,
}

impl From<&TestDescriptor> for GeneratorConfig {
    fn from(test: &TestDescriptor) -> Self {
        Self {
            count: test.tx_requests,
            payload_min: test.payload_min_bytes,
            payload_max: test.payload_max_bytes,
            latency_frequency: test.latency_frequency,
        }
    }
}

/// Generator state
pub struct Generator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic payloads, for tests and benchmarks.
    pub fn seeded(config: GeneratorConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: GeneratorConfig, rng: StdRng) -> Self {
        Self { config, rng }
    }

    /// Build the block carrying `sequence`.
    pub fn next_block(&mut self, sequence: u32) -> Block {
        let max = self.config.payload_max;
        let min = self.config.payload_min.min(max);
        let len = self.rng.gen_range(min..=max) as usize;

        let mut data = vec![0u8; len];
        self.rng.fill_bytes(&mut data);

        let block_type = if self.is_latency_probe(sequence) {
            BlockType::LatencyRequest
        } else {
            BlockType::Plain
        };

        Block::new(sequence, block_type, data)
    }

    fn is_latency_probe(&self, sequence: u32) -> bool {
        let freq = self.config.latency_frequency;
        freq > 0 && (sequence as u64 + 1) % freq as u64 == 0
    }

    /// Run the generator, sending `count` blocks with sequences 0..count.
    /// Dropping `tx` on return closes the queue. Returns the number of blocks
    /// handed to the Sender.
    pub async fn run(mut self, tx: BlockSender) -> u32 {
        tracing::debug!("generator started");

        for sequence in 0..self.config.count {
            let block = self.next_block(sequence);
            if tx.send(block).await.is_err() {
                // Sender stopped early; its own error explains why
                tracing::debug!("block queue closed after {} blocks", sequence);
                return sequence;
            }
        }

        tracing::debug!("generator complete ({} blocks)", self.config.count);
        self.config.count
    }
}
