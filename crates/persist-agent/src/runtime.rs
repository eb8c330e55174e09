//! Agent poll loop.
//!
//! Each tick sends one heartbeat, carrying the result of the previous
//! command if there is one, and acts on whatever command comes back. A tick
//! never fails: network, decryption and evaluation errors are logged and
//! the loop is rescheduled.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use persist_core::{EncryptionKey, crypto};
use persist_transport::{PollRequest, PollResponse};
use serde_json::Value;

use crate::TransportError;

/// Default gap between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Sends one poll to the listener.
#[async_trait]
pub trait PollTransport: Send + Sync {
    /// # Errors
    /// Returns error if the listener cannot be reached or rejects the poll.
    async fn poll(&self, request: &PollRequest) -> Result<PollResponse, TransportError>;
}

/// Runs a command in the agent's execution context.
pub trait CommandEvaluator: Send + Sync {
    /// Evaluate `command`.
    ///
    /// `Ok(None)` means the command produced no value and nothing is reported.
    ///
    /// # Errors
    /// Returns a description of the failure; it is reported as `Error: <msg>`.
    fn evaluate(&self, command: &str) -> Result<Option<Value>, String>;
}

impl<E: CommandEvaluator> CommandEvaluator for std::sync::Arc<E> {
    fn evaluate(&self, command: &str) -> Result<Option<Value>, String> {
        (**self).evaluate(command)
    }
}

/// Whether strong cryptography is usable right now.
///
/// Queried on every tick.
pub trait CryptoCapability: Send + Sync {
    fn is_available(&self) -> bool;
}

impl<F> CryptoCapability for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_available(&self) -> bool {
        self()
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Poll succeeded with no command.
    Idle,
    /// A command was evaluated; `reported` is whether it produced a result.
    Executed { reported: bool },
    /// A command arrived but could not be decrypted; nothing ran.
    Undecryptable,
    /// The poll did not reach the listener. Any pending result is kept.
    Unreachable,
}

#[derive(Debug, Clone)]
struct PendingResult {
    text: String,
    encrypted: bool,
}

/// Agent side of the channel for one session.
pub struct AgentRuntime<T, E, C>
where
    T: PollTransport,
    E: CommandEvaluator,
    C: CryptoCapability,
{
    session_id: String,
    transport: T,
    evaluator: E,
    capability: C,
    key: Option<EncryptionKey>,
    interval: Duration,
    pending: Option<PendingResult>,
}

impl<T, E, C> AgentRuntime<T, E, C>
where
    T: PollTransport,
    E: CommandEvaluator,
    C: CryptoCapability,
{
    /// Create a runtime for `session_id` with no key and the default interval.
    #[must_use]
    pub fn new(session_id: impl Into<String>, transport: T, evaluator: E, capability: C) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
            evaluator,
            capability,
            key: None,
            interval: DEFAULT_POLL_INTERVAL,
            pending: None,
        }
    }

    /// Use `key` for command decryption and result encryption.
    #[must_use]
    pub fn with_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Replace the gap between polls.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a result is waiting to be delivered.
    #[must_use]
    pub const fn has_pending_result(&self) -> bool {
        self.pending.is_some()
    }

    fn crypto_key(&self) -> Option<&EncryptionKey> {
        self.key.as_ref().filter(|_| self.capability.is_available())
    }

    /// Perform one poll and act on its reply.
    pub async fn tick(&mut self) -> Tick {
        let key = self.crypto_key().cloned();

        let mut request = PollRequest::heartbeat(self.session_id.clone(), key.is_none());
        if let Some(pending) = &self.pending {
            request = request.with_response(pending.text.clone(), pending.encrypted);
        }

        let reply = match self.transport.poll(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Poll failed: {e}");
                return Tick::Unreachable;
            }
        };
        self.pending = None;

        let Some(command) = reply.command.filter(|c| !c.is_empty()) else {
            return Tick::Idle;
        };

        let arrived_encrypted = key.is_some() && crypto::looks_encrypted(&command);
        let command = match (&key, arrived_encrypted) {
            (Some(key), true) => match crypto::decrypt(&command, key) {
                Some(plain) => plain,
                None => {
                    tracing::warn!(session_id = %self.session_id, "Could not decrypt command, skipping");
                    return Tick::Undecryptable;
                }
            },
            _ => command,
        };

        let Some(result) = self.evaluate(&command) else {
            return Tick::Executed { reported: false };
        };

        self.pending = Some(match key.filter(|_| arrived_encrypted) {
            Some(key) => PendingResult {
                text: crypto::encrypt(&result, &key),
                encrypted: true,
            },
            None => PendingResult {
                text: result,
                encrypted: false,
            },
        });
        Tick::Executed { reported: true }
    }

    fn evaluate(&self, command: &str) -> Option<String> {
        match self.evaluator.evaluate(command) {
            Ok(Some(Value::String(s))) => Some(s),
            Ok(Some(value)) => Some(value.to_string()),
            Ok(None) => None,
            Err(message) => Some(format!("Error: {message}")),
        }
    }

    /// Poll on the configured interval until `shutdown` resolves.
    ///
    /// One poll is in flight at a time; the next is scheduled after the
    /// previous one completes.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        tracing::info!(session_id = %self.session_id, interval = ?self.interval, "Agent started");

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(self.interval) => {}
            }
            let outcome = self.tick().await;
            tracing::debug!(session_id = %self.session_id, ?outcome, "Tick");
        }

        tracing::info!(session_id = %self.session_id, "Agent stopped");
    }
}
