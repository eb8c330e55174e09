//! HTTP transport for the persistent command channel.
//!
//! Provides:
//! - Wire protocol (JSON, camelCase with legacy aliases)
//! - Axum router for poll / submit / status (feature: server)
//! - JWT operator authentication (feature: server)

pub mod protocol;

#[cfg(feature = "server")]
pub mod auth;
#[cfg(feature = "server")]
pub mod error;
#[cfg(feature = "server")]
pub mod http;

pub use protocol::{PollRequest, PollResponse};

#[cfg(feature = "server")]
pub use auth::{DenyAll, JwtAuthenticator};
#[cfg(feature = "server")]
pub use error::ApiError;
#[cfg(feature = "server")]
pub use http::{AppState, router};
