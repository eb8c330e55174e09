//! Axum router for the command channel.
//!
//! Endpoints:
//! - POST /api/persist - agent poll (open to any origin)
//! - PUT  /api/persist - queue a command (operator)
//! - GET  /api/persist - session status (operator)
//! - GET  /health      - liveness probe

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
};
use persist_core::traits::{Authenticator, Operator, SessionId, SessionStorage, SettingsStore};
use persist_session::{AgentPoll, SessionBroker, SessionStatus};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    ApiError,
    auth::extract_token,
    protocol::{
        CommandRequest, CommandResponse, PollRequest, PollResponse, StatusQuery, StatusResponse,
    },
};

/// Path shared by the three channel operations.
pub const CHANNEL_PATH: &str = "/api/persist";

/// Shared state for all handlers.
pub struct AppState<S, K>
where
    S: SessionStorage,
    K: SettingsStore,
{
    pub broker: Arc<SessionBroker<S, K>>,
    pub auth: Arc<dyn Authenticator>,
    pub cookie_name: Arc<str>,
}

impl<S, K> Clone for AppState<S, K>
where
    S: SessionStorage,
    K: SettingsStore,
{
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            auth: Arc::clone(&self.auth),
            cookie_name: Arc::clone(&self.cookie_name),
        }
    }
}

impl<S, K> AppState<S, K>
where
    S: SessionStorage,
    K: SettingsStore,
{
    #[must_use]
    pub fn new(
        broker: SessionBroker<S, K>,
        auth: Arc<dyn Authenticator>,
        cookie_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            broker: Arc::new(broker),
            auth,
            cookie_name: cookie_name.into(),
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Operator, ApiError> {
        let token = extract_token(headers, &self.cookie_name).ok_or(ApiError::Unauthorized)?;
        self.auth.verify(token).map_err(|e| {
            tracing::warn!("Operator authentication failed: {e}");
            ApiError::Unauthorized
        })
    }
}

/// Wildcard CORS, including private-network preflights.
///
/// The poll caller is an arbitrary third-party page.
#[must_use]
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_private_network(true)
        .max_age(Duration::from_secs(86_400))
}

/// Build the router.
///
/// # Example
/// ```ignore
/// let state = AppState::new(broker, Arc::new(JwtAuthenticator::new(secret)), "persist_session");
/// axum::serve(listener, router(state)).await?;
/// ```
pub fn router<S, K>(state: AppState<S, K>) -> Router
where
    S: SessionStorage + 'static,
    K: SettingsStore + 'static,
{
    Router::new()
        .route(
            CHANNEL_PATH,
            post(poll_handler::<S, K>)
                .put(submit_handler::<S, K>)
                .get(status_handler::<S, K>),
        )
        .route("/health", get(health_handler))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Bodies are parsed by hand so that agents may post JSON as text/plain and
// skip the preflight, and so that operator auth runs before body parsing.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn poll_handler<S, K>(
    State(state): State<AppState<S, K>>,
    body: Bytes,
) -> Result<Json<PollResponse>, ApiError>
where
    S: SessionStorage + 'static,
    K: SettingsStore + 'static,
{
    let request: PollRequest = parse_body(&body)?;
    let session_id = request
        .session_id()
        .ok_or(ApiError::MissingField("sessionId"))?;

    let poll = AgentPoll {
        session_id: SessionId::from(session_id),
        response: request.response_text(),
        encrypted: request.encrypted,
        no_crypto: request.no_crypto,
    };
    let outcome = state.broker.poll(poll).await?;

    Ok(Json(PollResponse {
        command: outcome.command,
    }))
}

async fn submit_handler<S, K>(
    State(state): State<AppState<S, K>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CommandResponse>, ApiError>
where
    S: SessionStorage + 'static,
    K: SettingsStore + 'static,
{
    let operator = state.authenticate(&headers)?;
    let request: CommandRequest = parse_body(&body)?;

    let session_id = request
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingField("sessionId"))?;
    let command = request
        .command
        .filter(|c| !c.is_empty())
        .ok_or(ApiError::MissingField("command"))?;

    let session_id = SessionId::from(session_id);
    tracing::info!(operator = %operator.username, session_id = %session_id, "Command submitted");
    state.broker.submit_command(&session_id, &command).await?;

    Ok(Json(CommandResponse { success: true }))
}

async fn status_handler<S, K>(
    State(state): State<AppState<S, K>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError>
where
    S: SessionStorage + 'static,
    K: SettingsStore + 'static,
{
    state.authenticate(&headers)?;
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingField("sessionId"))?;

    let status = state.broker.status(&SessionId::from(session_id)).await?;
    Ok(Json(status.into()))
}

impl From<SessionStatus> for StatusResponse {
    fn from(status: SessionStatus) -> Self {
        let session = status.session;
        Self {
            connected: status.connected,
            last_seen: session.as_ref().map(|s| s.last_seen),
            elapsed_seconds: session.as_ref().map(|s| s.seconds_since_seen),
            last_response_at: session.as_ref().and_then(|s| s.last_response_at),
            last_response: session.and_then(|s| s.last_response),
            encrypted: status.encrypted,
        }
    }
}
