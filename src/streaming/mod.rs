//! Traffic loop protocol engine.
//!
//! Two peers run the same engine over one reliable, ordered byte stream.
//! Four tasks per side share the connection:
//!
//! # Architecture
//!
//! ```text
//! +-----------+     +----------+            +----------+     +----------+
//! | Generator | --> |  Sender  | -- wire -> | Receiver | --> | Verifier |
//! +-----------+     +----------+            +----------+     +----------+
//!                        ^                        |
//!                        +---- latency echoes ----+
//! ```
//!
//! Latency probes travel as ordinary sequenced blocks: a received request's
//! timestamp rides back on the next outgoing plain block, so there is only
//! ever one ordered stream per direction.
//!
//! # Failure model
//!
//! Every error is fatal to the run. Loops report into a shared error queue
//! and the session surfaces the first one. The Verifier cancels the other
//! loops by closing the shared [`Connection`], nothing else.

pub mod channel;
pub mod connection;
pub mod generator;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod verifier;

pub use channel::{
    Counters, ErrorSink, LatencyStats, ERROR_CHANNEL_SIZE, GENERATOR_CHANNEL_SIZE,
    LATENCY_CHANNEL_SIZE, VERIFIER_CHANNEL_SIZE,
};
pub use connection::Connection;
pub use generator::{Generator, GeneratorConfig};
pub use pipeline::{RunReport, Session, SessionState};
pub use protocol::{Block, BlockType, Message, TestDescriptor, TestResult, MAGIC_HEADER};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{Pacer, Sender, SenderConfig};
pub use verifier::{Verifier, VerifierConfig};
