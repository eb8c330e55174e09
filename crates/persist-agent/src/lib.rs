//! Reference agent for the persistent command channel.
//!
//! Provides:
//! - `AgentRuntime` - Poll, decrypt, evaluate, report loop
//! - Seams for the transport, the evaluator and crypto capability detection
//! - `HttpTransport` - reqwest-backed poll transport

pub mod error;
pub mod http_transport;
pub mod runtime;

pub use error::TransportError;
pub use http_transport::HttpTransport;
pub use runtime::{AgentRuntime, CommandEvaluator, CryptoCapability, PollTransport, Tick};
