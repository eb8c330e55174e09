//! Command broker: the server side of the poll / submit / status protocol.
//!
//! Per session the broker infers one of three states from heartbeat gaps
//! (unknown, live, stale) and never stores them. Commands are fire-and-forget:
//! at most one is pending, a new one overwrites it, and it is cleared the
//! moment an agent poll picks it up.
//!
//! Encryption is negotiated per poll. The key is looked up fresh for every
//! encrypt/decrypt so rotation applies on the next exchange, and a command is
//! only encrypted when the agent did not report `no_crypto`.

use std::{borrow::Cow, sync::Arc};

use persist_core::{
    Clock, Liveness, LivenessPolicy, SystemClock, crypto,
    traits::{SessionId, SessionSnapshot, SessionStorage, SettingsStore, StorageError},
};

/// Broker error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No session for {0}")]
    NotFound(SessionId),
    #[error("Session {session_id} disconnected (last seen {elapsed_secs}s ago)")]
    Disconnected {
        session_id: SessionId,
        elapsed_secs: i64,
    },
}

/// One agent poll.
#[derive(Debug, Clone)]
pub struct AgentPoll {
    pub session_id: SessionId,
    /// Result of the previously delivered command, if any.
    pub response: Option<String>,
    /// Whether `response` claims to be an encrypted token.
    pub encrypted: bool,
    /// The agent cannot decrypt; commands must be sent in the clear.
    pub no_crypto: bool,
}

impl AgentPoll {
    /// A bare heartbeat with no result attached.
    #[must_use]
    pub fn heartbeat(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            response: None,
            encrypted: false,
            no_crypto: false,
        }
    }
}

/// What the agent receives back from a poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Drained command, possibly as an encrypted token.
    pub command: Option<String>,
    /// Whether `command` was encrypted.
    pub encrypted: bool,
}

/// Operator-facing view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Live within the status window.
    pub connected: bool,
    pub liveness: Liveness,
    /// Whether a valid key is currently configured.
    pub encrypted: bool,
    /// `None` if the session has never polled.
    pub session: Option<SessionSnapshot>,
}

/// Session broker implementing the command channel.
///
/// Operator operations (`submit_command`, `status`) assume the caller has
/// already authenticated the operator; `poll` is open to any agent.
pub struct SessionBroker<S, K>
where
    S: SessionStorage,
    K: SettingsStore,
{
    storage: S,
    settings: K,
    policy: LivenessPolicy,
    clock: Arc<dyn Clock>,
}

impl<S, K> SessionBroker<S, K>
where
    S: SessionStorage,
    K: SettingsStore,
{
    /// Create a broker with the default liveness policy and wall-clock time.
    #[must_use]
    pub fn new(storage: S, settings: K) -> Self {
        Self {
            storage,
            settings,
            policy: LivenessPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the liveness policy.
    #[must_use]
    pub fn with_policy(mut self, policy: LivenessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub const fn settings(&self) -> &K {
        &self.settings
    }

    #[must_use]
    pub const fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Handle an agent poll.
    ///
    /// Stores any attached result, records the heartbeat, and drains the
    /// pending command. Creates the session on first contact.
    ///
    /// # Errors
    /// Returns error only if storage fails.
    pub async fn poll(&self, poll: AgentPoll) -> Result<PollOutcome, BrokerError> {
        let now = self.clock.now();
        let id = &poll.session_id;

        if let Some(response) = poll.response.as_deref() {
            let stored = self.recover_response(id, response, poll.encrypted).await;
            self.storage.record_response(id, &stored, now).await?;
        }

        let Some(command) = self.storage.upsert_heartbeat(id, now).await? else {
            tracing::debug!(
                session_id = %id,
                response = poll.response.is_some(),
                no_crypto = poll.no_crypto,
                "Poll, no command"
            );
            return Ok(PollOutcome::default());
        };

        let key = if poll.no_crypto {
            None
        } else {
            self.settings.current_key().await
        };

        let outcome = match key {
            Some(key) => PollOutcome {
                command: Some(crypto::encrypt(&command, &key)),
                encrypted: true,
            },
            None => PollOutcome {
                command: Some(command),
                encrypted: false,
            },
        };

        tracing::info!(
            session_id = %id,
            encrypted = outcome.encrypted,
            no_crypto = poll.no_crypto,
            "Command delivered"
        );
        Ok(outcome)
    }

    /// Decrypt a response if it claims to be encrypted and a key is set.
    /// Falls back to the raw token rather than dropping the result.
    async fn recover_response<'a>(
        &self,
        id: &SessionId,
        response: &'a str,
        encrypted: bool,
    ) -> Cow<'a, str> {
        if !encrypted {
            return Cow::Borrowed(response);
        }
        let Some(key) = self.settings.current_key().await else {
            tracing::warn!(session_id = %id, "Encrypted response but no key configured, storing raw");
            return Cow::Borrowed(response);
        };
        crypto::decrypt(response, &key).map_or_else(
            || {
                tracing::warn!(session_id = %id, "Response could not be decrypted, storing raw");
                Cow::Borrowed(response)
            },
            Cow::Owned,
        )
    }

    /// Queue a command for a live session, replacing any undelivered one.
    ///
    /// # Errors
    /// Returns `BrokerError::NotFound` if the session never polled and
    /// `BrokerError::Disconnected` if it has been silent longer than the
    /// submit window.
    pub async fn submit_command(&self, id: &SessionId, command: &str) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let snapshot = self
            .storage
            .read_status(id, now)
            .await?
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;

        if !self.policy.permits_submit(now - snapshot.last_seen) {
            tracing::info!(
                session_id = %id,
                elapsed_secs = snapshot.seconds_since_seen,
                "Command rejected, session disconnected"
            );
            return Err(BrokerError::Disconnected {
                session_id: id.clone(),
                elapsed_secs: snapshot.seconds_since_seen,
            });
        }

        self.storage
            .queue_command(id, command)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(id) => BrokerError::NotFound(id),
                other => BrokerError::Storage(other),
            })?;

        tracing::info!(session_id = %id, len = command.len(), "Command queued");
        Ok(())
    }

    /// Report liveness, last response and encryption state of a session.
    ///
    /// # Errors
    /// Returns error only if storage fails.
    pub async fn status(&self, id: &SessionId) -> Result<SessionStatus, BrokerError> {
        let now = self.clock.now();
        let encrypted = self.settings.current_key().await.is_some();
        let session = self.storage.read_status(id, now).await?;
        let liveness = self
            .policy
            .classify(session.as_ref().map(|s| s.seconds_since_seen));

        Ok(SessionStatus {
            connected: liveness == Liveness::Live,
            liveness,
            encrypted,
            session,
        })
    }
}
