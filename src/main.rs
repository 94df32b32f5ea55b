use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trafficloop::config::{Scenario, TestMode};
use trafficloop::server::{self, ServerConfig};
use trafficloop::client;

#[derive(Parser)]
#[command(name = "trafficloop")]
#[command(about = "Synthetic traffic exchange for measuring a transport", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter, e.g. "debug" or "trafficloop=trace". Overrides RUST_LOG.
    #[arg(long, global = true, env = "TRAFFICLOOP_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for initiators and run whatever tests they propose
    Listen {
        #[arg(long, default_value = "0.0.0.0:7070")]
        bind: SocketAddr,

        /// Progress logging interval in milliseconds (0 = off)
        #[arg(long, default_value_t = 0)]
        progress_ms: u64,
    },

    /// Connect to a responder and run a scenario
    Dial {
        #[arg(long)]
        addr: SocketAddr,

        /// TOML scenario file
        #[arg(long)]
        scenario: PathBuf,

        /// Run only this test from the scenario
        #[arg(long)]
        test: Option<String>,

        /// Only transmit; the responder only receives
        #[arg(long)]
        tx_only: bool,

        /// Only receive; the responder only transmits
        #[arg(long)]
        rx_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Listen { bind, progress_ms } => {
            let config = ServerConfig {
                progress_interval: Some(Duration::from_millis(progress_ms))
                    .filter(|i| !i.is_zero()),
            };
            server::run_server(bind, config)
                .await
                .context("responder failed")?;
        }
        Command::Dial {
            addr,
            scenario,
            test,
            tx_only,
            rx_only,
        } => {
            // Reject conflicting flags before touching the network
            let mode = TestMode::from_flags(tx_only, rx_only)?;

            let mut loaded = Scenario::load(&scenario)
                .with_context(|| format!("loading {}", scenario.display()))?;
            if let Some(name) = test {
                loaded = loaded.select(&name)?;
            }
            let loaded = loaded.with_mode(mode)?;

            let reports = client::run_scenario(addr, &loaded)
                .await
                .with_context(|| format!("scenario against {}", addr))?;

            for report in &reports {
                let latency = match report.latency.mean() {
                    Some(mean) => format!(
                        "latency min {:?} mean {:?} max {:?} ({} samples)",
                        report.latency.min.unwrap_or_default(),
                        mean,
                        report.latency.max.unwrap_or_default(),
                        report.latency.samples
                    ),
                    None => "no latency samples".to_string(),
                };
                println!(
                    "{}: tx {} rx {} verified {} in {:?}, {}",
                    report.name,
                    report.tx_count,
                    report.rx_count,
                    report.verified,
                    report.elapsed,
                    latency
                );
            }
        }
    }

    Ok(())
}
