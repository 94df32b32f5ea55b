//! Responder role - runs when invoked as `trafficloop listen`.
//!
//! Accepts connections, reads the test each initiator proposes, runs the
//! mirrored test and reports the outcome back as a result frame.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::Instrument;

use crate::error::Result;
use crate::streaming::{Connection, RunReport, Session, TestResult};
use crate::transport;

/// Responder options
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub progress_interval: Option<Duration>,
}

/// Accept connections until `shutdown` resolves. Each connection is served in
/// its own task.
pub async fn serve<F>(listener: TcpListener, config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tracing::info!("listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                return Ok(());
            }
            accepted = transport::accept(&listener) => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("accept failed: {}", err);
                        continue;
                    }
                };
                let config = config.clone();
                let span = tracing::info_span!("peer", addr = %peer);
                tokio::spawn(
                    async move {
                        if let Err(err) = handle_connection(conn, &config).await {
                            tracing::error!("{}", err);
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}

/// Serve one initiator: read its test, run the mirrored test, send the result.
///
/// The run's own error is reported to the peer and returned; a failure to
/// deliver the result is logged.
pub async fn handle_connection(conn: Connection, config: &ServerConfig) -> Result<RunReport> {
    let mut session = Session::new(conn);
    if let Some(interval) = config.progress_interval {
        session = session.with_progress_interval(interval);
    }

    let test = session.rx_test().await?.mirrored();
    let outcome = session.run(&test).await;

    if let Err(err) = session.tx_result(&TestResult::from_outcome(&outcome)).await {
        tracing::warn!("could not deliver result: {}", err);
    }

    if let Ok(report) = &outcome {
        tracing::info!(
            "test '{}' passed: tx {} rx {} in {:?}",
            report.name,
            report.tx_count,
            report.rx_count,
            report.elapsed
        );
    }
    outcome
}

/// Bind and serve until Ctrl-C.
pub async fn run_server(bind: SocketAddr, config: ServerConfig) -> Result<()> {
    let listener = transport::bind(bind).await?;
    serve(listener, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
