//! API error type and its HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use persist_session::BrokerError;

use crate::protocol::ErrorBody;

/// HTTP API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing {0}")]
    MissingField(&'static str),
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingField(_) | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Broker(BrokerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Broker(BrokerError::Disconnected { .. }) => StatusCode::BAD_REQUEST,
            Self::Broker(BrokerError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::MissingField(field) => ErrorBody::new(format!("missing {field}")),
            Self::InvalidBody(reason) => ErrorBody::new("invalid body").with_message(reason.clone()),
            Self::Unauthorized => ErrorBody::new("unauthorized"),
            Self::Broker(BrokerError::NotFound(id)) => {
                ErrorBody::new("no session").with_message(format!("No session for {id}"))
            }
            Self::Broker(BrokerError::Disconnected { elapsed_secs, .. }) => ErrorBody {
                error: "disconnected".to_string(),
                message: Some(format!("Session disconnected (last seen {elapsed_secs}s ago)")),
                elapsed_seconds: Some(*elapsed_secs),
            },
            Self::Broker(BrokerError::Storage(_)) => ErrorBody::new("internal error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        (status, Json(self.body())).into_response()
    }
}
