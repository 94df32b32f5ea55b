//! Session coordinator.
//!
//! Orchestrates Generator, Sender, Receiver and Verifier tasks over one
//! shared connection, and exchanges the test descriptor and result frames
//! around a run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use crate::error::{LoopError, Result};
use crate::streaming::channel::{
    error_channel, generator_channel, latency_channel, verifier_channel, Counters, LatencyStats,
};
use crate::streaming::connection::Connection;
use crate::streaming::protocol::{TestDescriptor, TestResult};
use crate::streaming::{
    Generator, GeneratorConfig, Receiver, ReceiverConfig, Sender, SenderConfig, Verifier,
    VerifierConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub name: String,
    pub tx_count: u32,
    pub rx_count: u32,
    /// Blocks that passed sequence and hash checks
    pub verified: u32,
    pub latency: LatencyStats,
    pub elapsed: Duration,
}

/// One side of a test over one connection.
pub struct Session {
    conn: Arc<Connection>,
    counters: Arc<Counters>,
    state: SessionState,
    progress_interval: Option<Duration>,
}

impl Session {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
            counters: Arc::new(Counters::new()),
            state: SessionState::Idle,
            progress_interval: None,
        }
    }

    /// Log tx/rx counters at this interval while a run is in progress.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Send the test descriptor to the peer.
    pub async fn tx_test(&self, test: &TestDescriptor) -> Result<()> {
        self.conn.send(test).await?;
        tracing::info!("-> [test] {}", test.name);
        Ok(())
    }

    /// Read the test descriptor sent by the peer.
    pub async fn rx_test(&self) -> Result<TestDescriptor> {
        let test: TestDescriptor = self.conn.recv().await?;
        tracing::info!("<- [test] {}", test.name);
        Ok(test)
    }

    pub async fn tx_result(&self, result: &TestResult) -> Result<()> {
        self.conn.send(result).await?;
        tracing::info!("-> [result] success={}", result.success);
        Ok(())
    }

    pub async fn rx_result(&self) -> Result<TestResult> {
        let result: TestResult = self.conn.recv().await?;
        tracing::info!("<- [result] success={}", result.success);
        Ok(result)
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Run the test: start all loops, wait for the transmit and receive loops
    /// to finish, and return the first error any of them reported.
    pub async fn run(&mut self, test: &TestDescriptor) -> Result<RunReport> {
        if self.state != SessionState::Idle {
            return Err(LoopError::InvalidState { state: self.state });
        }
        test.validate()?;

        self.state = SessionState::Running;
        let span = tracing::info_span!("test", name = %test.name);
        let outcome = self.run_loops(test).instrument(span).await;

        self.state = match outcome {
            Ok(_) => SessionState::Completed,
            Err(_) => SessionState::Failed,
        };
        outcome
    }

    async fn run_loops(&self, test: &TestDescriptor) -> Result<RunReport> {
        let started = Instant::now();
        let (errors, mut error_rx) = error_channel();
        let (block_tx, block_rx) = generator_channel();
        let (latency_tx, latency_rx) = latency_channel();

        let generator = Generator::new(GeneratorConfig::from(test));
        let gen_handle = tokio::spawn(generator.run(block_tx).in_current_span());

        let progress_handle = self.progress_interval.map(|interval| {
            tokio::spawn(report_progress(Arc::clone(&self.counters), interval).in_current_span())
        });

        // Receive side only exists when something is expected
        let (rx_handle, verifier_handle) = if test.rx_requests > 0 {
            let (verify_tx, verify_rx) = verifier_channel();

            let verifier = Verifier::new(
                VerifierConfig::from(test),
                Arc::clone(&self.conn),
                Arc::clone(&self.counters),
                errors.clone(),
            );
            let verifier_handle = tokio::spawn(verifier.run(verify_rx).in_current_span());

            let receiver = Receiver::new(
                ReceiverConfig {
                    rx_requests: test.rx_requests,
                },
                Arc::clone(&self.conn),
                Arc::clone(&self.counters),
                errors.clone(),
            );
            let rx_handle =
                tokio::spawn(receiver.run(verify_tx, latency_tx).in_current_span());

            (Some(rx_handle), Some(verifier_handle))
        } else {
            drop(latency_tx);
            (None, None)
        };

        let sender = Sender::new(
            SenderConfig::from(test),
            Arc::clone(&self.conn),
            Arc::clone(&self.counters),
            errors,
        );
        let tx_handle = tokio::spawn(sender.run(block_rx, latency_rx).in_current_span());

        let latency = match rx_handle {
            Some(handle) => handle.await?,
            None => LatencyStats::new(),
        };
        tx_handle.await?;

        // The receive loop closed the verifier's queue, so this is prompt and
        // catches a failure on the final block.
        let verified = match verifier_handle {
            Some(handle) => handle.await?,
            None => 0,
        };

        gen_handle.abort();
        if let Some(handle) = progress_handle {
            handle.abort();
        }

        if let Ok(err) = error_rx.try_recv() {
            return Err(err);
        }

        let report = RunReport {
            name: test.name.clone(),
            tx_count: self.counters.tx_count(),
            rx_count: self.counters.rx_count(),
            verified,
            latency,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "complete: tx {} rx {} verified {} in {:?}",
            report.tx_count,
            report.rx_count,
            report.verified,
            report.elapsed
        );
        Ok(report)
    }
}

async fn report_progress(counters: Arc<Counters>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tracing::info!(
            "progress: tx {} rx {} last rx {:?} ms ago",
            counters.tx_count(),
            counters.rx_count(),
            counters.millis_since_last_rx()
        );
    }
}
