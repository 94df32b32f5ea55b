//! Scenario files and run modes.
//!
//! A scenario is a TOML file listing the tests an initiator runs, in order:
//!
//! ```toml
//! progress_interval_ms = 1000
//!
//! [[test]]
//! name = "throughput"
//! tx_requests = 10000
//! rx_requests = 10000
//! payload_min_bytes = 1024
//! payload_max_bytes = 4096
//!
//! [[test]]
//! name = "latency"
//! tx_requests = 500
//! rx_requests = 500
//! latency_frequency = 10
//! tx_pacing_ms = 5
//! tx_max_jitter_ms = 3
//! ```
//!
//! Omitted test fields fall back to [`TestDescriptor::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoopError, Result};
use crate::streaming::TestDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Periodic progress logging during each run. 0 = off.
    pub progress_interval_ms: u64,

    #[serde(rename = "test")]
    pub tests: Vec<TestDescriptor>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoopError::Config(format!("cannot read scenario {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let scenario: Scenario =
            toml::from_str(text).map_err(|e| LoopError::Config(format!("invalid scenario: {}", e)))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Every test must be valid and names must be unique.
    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            return Err(LoopError::Config("scenario defines no tests".to_string()));
        }
        for (i, test) in self.tests.iter().enumerate() {
            test.validate()?;
            if self.tests[..i].iter().any(|t| t.name == test.name) {
                return Err(LoopError::Config(format!(
                    "duplicate test name '{}'",
                    test.name
                )));
            }
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        match self.progress_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Keep only the named test.
    pub fn select(mut self, name: &str) -> Result<Self> {
        self.tests.retain(|t| t.name == name);
        if self.tests.is_empty() {
            return Err(LoopError::Config(format!("no test named '{}'", name)));
        }
        Ok(self)
    }

    /// Apply a run mode to every test, then re-validate.
    pub fn with_mode(mut self, mode: TestMode) -> Result<Self> {
        for test in &mut self.tests {
            mode.apply(test);
        }
        self.validate()?;
        Ok(self)
    }
}

/// Direction of traffic from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    #[default]
    Bidirectional,
    TransmitOnly,
    ReceiveOnly,
}

impl TestMode {
    /// Build the mode from the mutually exclusive `--tx-only` / `--rx-only`
    /// flags.
    pub fn from_flags(tx_only: bool, rx_only: bool) -> Result<Self> {
        match (tx_only, rx_only) {
            (true, true) => Err(LoopError::Conflict(
                "transmit-only and receive-only modes are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(TestMode::TransmitOnly),
            (false, true) => Ok(TestMode::ReceiveOnly),
            (false, false) => Ok(TestMode::Bidirectional),
        }
    }

    pub fn apply(self, test: &mut TestDescriptor) {
        match self {
            TestMode::Bidirectional => {}
            TestMode::TransmitOnly => test.rx_requests = 0,
            TestMode::ReceiveOnly => test.tx_requests = 0,
        }
    }
}
