//! Core traits for storage, settings and operator authentication.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EncryptionKey;

/// Opaque identifier correlating one agent's page load with a captured report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Persisted session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// External identifier shared with the report-capture side.
    pub session_id: SessionId,
    /// Server time of the most recent poll.
    pub last_seen: DateTime<Utc>,
    /// Command awaiting delivery; at most one.
    pub pending_command: Option<String>,
    /// Most recent result reported by the agent.
    pub last_response: Option<String>,
    /// When `last_response` was stored.
    pub last_response_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A freshly created session that has just polled.
    #[must_use]
    pub const fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            last_seen: now,
            pending_command: None,
            last_response: None,
            last_response_at: None,
        }
    }

    /// Project the row into a status snapshot relative to `now`.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            last_seen: self.last_seen,
            seconds_since_seen: elapsed_seconds(self.last_seen, now),
            last_response: self.last_response.clone(),
            last_response_at: self.last_response_at,
        }
    }
}

/// Point-in-time view of a session as returned by `read_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub last_seen: DateTime<Utc>,
    /// Whole seconds between `last_seen` and the read, rounded to nearest.
    pub seconds_since_seen: i64,
    pub last_response: Option<String>,
    pub last_response_at: Option<DateTime<Utc>>,
}

/// Whole seconds from `since` to `now`, rounded to nearest, never negative.
#[must_use]
pub fn elapsed_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (now - since).num_milliseconds().max(0);
    (millis + 500) / 1000
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
///
/// Every mutating call takes `now` from the caller so that a single clock
/// governs liveness arithmetic regardless of backend.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Record a heartbeat and drain the pending command in one atomic step.
    ///
    /// Creates the session if it does not exist. Returns the command that was
    /// cleared, if any. A command queued concurrently is either returned here
    /// or left in place for the next heartbeat, never both and never neither.
    async fn upsert_heartbeat(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError>;

    /// Store the latest agent result. Creates the session if it does not exist.
    async fn record_response(
        &self,
        id: &SessionId,
        response: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Set the pending command, overwriting any unconsumed one.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the session has never polled.
    async fn queue_command(&self, id: &SessionId, command: &str) -> Result<(), StorageError>;

    /// Read the liveness and response state of a session.
    async fn read_status(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSnapshot>, StorageError>;
}

/// Read access to operator-managed settings.
///
/// Implementations must not cache: every call reflects the value at the time
/// of the call so that key rotation applies to the very next poll.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Raw stored encryption key, if any value is stored.
    async fn encryption_key(&self) -> Result<Option<String>, StorageError>;

    /// The currently configured key, or `None` when encryption is disabled.
    ///
    /// Malformed values and lookup failures both degrade to plaintext.
    async fn current_key(&self) -> Option<EncryptionKey> {
        match self.encryption_key().await {
            Ok(raw) => raw.as_deref().and_then(EncryptionKey::parse),
            Err(e) => {
                tracing::warn!("Encryption key lookup failed, continuing unencrypted: {e}");
                None
            }
        }
    }
}

/// Authenticated dashboard operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub user_id: String,
    pub username: String,
    pub rank: u8,
}

/// Authentication error.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    Missing,
    #[error("Invalid credentials: {0}")]
    Invalid(String),
}

/// Trait for verifying operator session tokens.
pub trait Authenticator: Send + Sync {
    /// Resolve a session token to an operator identity.
    ///
    /// # Errors
    /// Returns `AuthError::Invalid` if the token cannot be verified.
    fn verify(&self, token: &str) -> Result<Operator, AuthError>;
}
