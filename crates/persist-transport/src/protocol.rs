//! Wire protocol for agent and operator requests.
//!
//! Field names are camelCase. The legacy browser payload's names (`rid`,
//! `nocrypto`, `report_id`) are accepted as aliases on input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent poll body (`POST`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(default, alias = "rid", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Result of the last command. Any JSON value is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, alias = "nocrypto")]
    pub no_crypto: bool,
}

impl PollRequest {
    /// A heartbeat from `session_id`, optionally declaring no crypto support.
    #[must_use]
    pub fn heartbeat(session_id: impl Into<String>, no_crypto: bool) -> Self {
        Self {
            session_id: Some(session_id.into()),
            no_crypto,
            ..Self::default()
        }
    }

    /// Attach a command result.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>, encrypted: bool) -> Self {
        self.response = Some(Value::String(response.into()));
        self.encrypted = encrypted;
        self
    }

    /// Session id, treating an empty string as missing.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }

    /// The response as it will be stored.
    ///
    /// Strings are kept verbatim, `null` counts as absent, and any other
    /// value is stored as its JSON text.
    #[must_use]
    pub fn response_text(&self) -> Option<String> {
        match self.response.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Reply to an agent poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Always serialized; `null` when there is nothing to run.
    #[serde(default, alias = "cmd")]
    pub command: Option<String>,
}

/// Operator command submission body (`PUT`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default, alias = "report_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

/// Successful command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
}

/// Status query string (`GET ?sessionId=`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    #[serde(default, alias = "report_id")]
    pub session_id: Option<String>,
}

/// Operator-facing session status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_at: Option<DateTime<Utc>>,
    pub encrypted: bool,
}

/// Error body for every non-2xx reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Short machine-readable reason, e.g. `"no session"`.
    pub error: String,
    /// Human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
}

impl ErrorBody {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
            elapsed_seconds: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
