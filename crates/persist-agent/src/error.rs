//! Agent transport errors.

/// Failure of a single poll round trip.
///
/// Never fatal to the agent loop; the next tick retries.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Listener returned HTTP {0}")]
    Status(u16),
    #[error("Listener unreachable: {0}")]
    Unreachable(String),
}
