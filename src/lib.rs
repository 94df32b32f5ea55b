//! trafficloop - synthetic traffic exchange for measuring a transport.
//!
//! Two peers stream sequenced, hashed blocks at each other with optional
//! pacing, jitter and latency probes, and verify ordering and integrity on
//! arrival. See [`streaming`] for the engine.

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod streaming;
pub mod transport;

pub use error::{LoopError, Result};
