//! Initiator role - runs when invoked as `trafficloop dial`.
//!
//! Runs each scenario test on a fresh connection: send the test, run it,
//! then read the responder's verdict.

use std::net::SocketAddr;

use crate::config::Scenario;
use crate::error::{LoopError, Result};
use crate::streaming::{Connection, RunReport, Session, TestDescriptor};
use crate::transport;

/// Run one test as initiator over an established connection.
///
/// A local failure wins over whatever the peer reports. Otherwise a failed
/// peer result becomes [`LoopError::PeerFailed`].
pub async fn run_test(
    conn: Connection,
    test: &TestDescriptor,
    scenario: &Scenario,
) -> Result<RunReport> {
    let mut session = Session::new(conn);
    if let Some(interval) = scenario.progress_interval() {
        session = session.with_progress_interval(interval);
    }

    // Never propose a test this side would refuse to run
    test.validate()?;
    session.tx_test(test).await?;
    let report = session.run(test).await?;

    let result = session.rx_result().await?;
    if !result.success {
        return Err(LoopError::PeerFailed(
            result.message.unwrap_or_else(|| "no reason given".to_string()),
        ));
    }
    Ok(report)
}

/// Run every test in the scenario against `addr`, stopping at the first
/// failure.
pub async fn run_scenario(addr: SocketAddr, scenario: &Scenario) -> Result<Vec<RunReport>> {
    let mut reports = Vec::with_capacity(scenario.tests.len());

    for test in &scenario.tests {
        let (conn, peer) = transport::dial(addr).await?;
        tracing::info!("connected to {} for test '{}'", peer, test.name);

        let report = run_test(conn, test, scenario).await?;
        tracing::info!(
            "test '{}' passed: tx {} rx {} verified {} latency samples {} in {:?}",
            report.name,
            report.tx_count,
            report.rx_count,
            report.verified,
            report.latency.samples,
            report.elapsed
        );
        reports.push(report);
    }

    Ok(reports)
}
