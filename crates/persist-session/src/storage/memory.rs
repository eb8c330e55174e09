//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persist_core::traits::{Session, SessionId, SessionSnapshot, SessionStorage, StorageError};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of sessions that have ever polled.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .len())
    }

    /// Whether no session has polled yet.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.len().map(|n| n == 0)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn upsert_heartbeat(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        // One write guard covers touch + drain.
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone(), now));

        // Overlapping polls may arrive out of order; never move backwards.
        session.last_seen = session.last_seen.max(now);
        Ok(session.pending_command.take())
    }

    async fn record_response(
        &self,
        id: &SessionId,
        response: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone(), now));

        session.last_response = Some(response.to_string());
        session.last_response_at = Some(now);

        Ok(())
    }

    async fn queue_command(&self, id: &SessionId, command: &str) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        session.pending_command = Some(command.to_string());

        Ok(())
    }

    async fn read_status(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .map(|s| s.snapshot(now)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    #[tokio::test]
    async fn test_heartbeat_creates_session() {
        let storage = MemoryStorage::new();
        let now = Utc::now();

        assert!(storage.is_empty().unwrap());
        assert_eq!(storage.upsert_heartbeat(&sid("r1"), now).await.unwrap(), None);
        assert_eq!(storage.len().unwrap(), 1);

        let snap = storage.read_status(&sid("r1"), now).await.unwrap().unwrap();
        assert_eq!(snap.last_seen, now);
        assert_eq!(snap.seconds_since_seen, 0);
        assert_eq!(snap.last_response, None);
    }

    #[tokio::test]
    async fn test_heartbeat_drains_exactly_once() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.upsert_heartbeat(&sid("r1"), now).await.unwrap();

        assert_ok!(storage.queue_command(&sid("r1"), "alert(1)").await);
        assert_eq!(
            storage.upsert_heartbeat(&sid("r1"), now).await.unwrap().as_deref(),
            Some("alert(1)")
        );
        assert_eq!(storage.upsert_heartbeat(&sid("r1"), now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_command_wins() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.upsert_heartbeat(&sid("r1"), now).await.unwrap();

        storage.queue_command(&sid("r1"), "first()").await.unwrap();
        storage.queue_command(&sid("r1"), "second()").await.unwrap();

        assert_eq!(
            storage.upsert_heartbeat(&sid("r1"), now).await.unwrap().as_deref(),
            Some("second()")
        );
    }

    #[tokio::test]
    async fn test_queue_to_unknown_session_fails() {
        let storage = MemoryStorage::new();
        let err = assert_err!(storage.queue_command(&sid("ghost"), "alert(1)").await);
        assert!(matches!(err, StorageError::NotFound(id) if id.as_str() == "ghost"));
    }

    #[tokio::test]
    async fn test_heartbeat_advances_last_seen() {
        let storage = MemoryStorage::new();
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(9);
        storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap();
        storage.upsert_heartbeat(&sid("r1"), t1).await.unwrap();

        let snap = storage
            .read_status(&sid("r1"), t1 + TimeDelta::seconds(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.last_seen, t1);
        assert_eq!(snap.seconds_since_seen, 3);
    }

    #[tokio::test]
    async fn test_record_response_keeps_pending_command() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.upsert_heartbeat(&sid("r1"), now).await.unwrap();
        storage.queue_command(&sid("r1"), "next()").await.unwrap();

        let later = now + TimeDelta::seconds(2);
        storage.record_response(&sid("r1"), "ok", later).await.unwrap();

        let snap = storage.read_status(&sid("r1"), later).await.unwrap().unwrap();
        assert_eq!(snap.last_response.as_deref(), Some("ok"));
        assert_eq!(snap.last_response_at, Some(later));
        assert_eq!(
            storage.upsert_heartbeat(&sid("r1"), later).await.unwrap().as_deref(),
            Some("next()")
        );
    }

    #[tokio::test]
    async fn test_concurrent_heartbeats_deliver_once() {
        let storage = Arc::new(MemoryStorage::new());
        let now = Utc::now();
        storage.upsert_heartbeat(&sid("r1"), now).await.unwrap();
        storage.queue_command(&sid("r1"), "once()").await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let storage = Arc::clone(&storage);
                let id = sid("r1");
                tokio::spawn(async move { storage.upsert_heartbeat(&id, now).await })
            })
            .collect();

        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        let storage = MemoryStorage::new();
        let t0 = Utc::now();
        let later = t0 + TimeDelta::seconds(5);

        storage.upsert_heartbeat(&sid("r1"), later).await.unwrap();
        storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap();

        let snap = storage.read_status(&sid("r1"), later).await.unwrap().unwrap();
        assert_eq!(snap.last_seen, later);
    }
}
