//! SQLite session storage (feature-gated).
//!
//! Also serves as the settings store: the encryption key lives in the
//! `settings` table under `persistent_key`.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persist_core::traits::{
    SessionId, SessionSnapshot, SessionStorage, SettingsStore, StorageError, elapsed_seconds,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

const KEY_SETTING: &str = "persistent_key";

const CREATE_SESSIONS: &str = r"
CREATE TABLE IF NOT EXISTS persistent_sessions (
    id               TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL UNIQUE,
    last_seen        INTEGER NOT NULL,
    pending_command  TEXT,
    last_response    TEXT,
    last_response_at INTEGER
)";

const CREATE_SETTINGS: &str = r"
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Internal(format!("Timestamp out of range: {millis}")))
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect to (creating if needed) the database at `database_url` and
    /// apply the schema.
    ///
    /// # Errors
    /// Returns error if database connection or schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database exists per connection, so pin exactly one.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;
        let storage = Self { pool };
        storage.migrate().await?;

        tracing::info!(in_memory, "SQLite session store ready");
        Ok(storage)
    }

    /// Private in-memory database, mainly for tests.
    ///
    /// # Errors
    /// Returns error if schema setup fails.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for ddl in [CREATE_SESSIONS, CREATE_SETTINGS] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    /// Store or clear the encryption key setting.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn set_encryption_key(&self, raw: Option<&str>) -> Result<(), StorageError> {
        match raw {
            Some(value) => {
                sqlx::query(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                )
                .bind(KEY_SETTING)
                .bind(value)
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM settings WHERE key = ?1")
                    .bind(KEY_SETTING)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    async fn upsert_heartbeat(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Writing first takes the database write lock, so no queue_command can
        // land between the read and the clear below.
        sqlx::query(
            "INSERT INTO persistent_sessions (id, session_id, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET last_seen = MAX(last_seen, excluded.last_seen)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(id.as_str())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let pending: Option<String> = sqlx::query_scalar(
            "SELECT pending_command FROM persistent_sessions WHERE session_id = ?1",
        )
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        if pending.is_some() {
            sqlx::query("UPDATE persistent_sessions SET pending_command = NULL WHERE session_id = ?1")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(pending)
    }

    async fn record_response(
        &self,
        id: &SessionId,
        response: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO persistent_sessions (id, session_id, last_seen, last_response, last_response_at)
             VALUES (?1, ?2, ?3, ?4, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 last_response = excluded.last_response,
                 last_response_at = excluded.last_response_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(id.as_str())
        .bind(now.timestamp_millis())
        .bind(response)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn queue_command(&self, id: &SessionId, command: &str) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE persistent_sessions SET pending_command = ?1 WHERE session_id = ?2")
                .bind(command)
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn read_status(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        let row: Option<(i64, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT last_seen, last_response, last_response_at
             FROM persistent_sessions WHERE session_id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some((last_seen, last_response, last_response_at)) = row else {
            return Ok(None);
        };

        let last_seen = from_millis(last_seen)?;
        Ok(Some(SessionSnapshot {
            last_seen,
            seconds_since_seen: elapsed_seconds(last_seen, now),
            last_response,
            last_response_at: last_response_at.map(from_millis).transpose()?,
        }))
    }
}

#[async_trait]
impl SettingsStore for SqliteStorage {
    async fn encryption_key(&self) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(KEY_SETTING)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use persist_core::{Clock, EncryptionKey, ManualClock, crypto};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{AgentPoll, BrokerError, SessionBroker};

    /// File-backed database in the temp dir, removed on drop.
    struct TempDb {
        path: std::path::PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("persist-{}.db", Uuid::new_v4()));
            Self { path }
        }

        fn url(&self) -> String {
            format!("sqlite://{}", self.path.display())
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
            }
        }
    }

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    // Millisecond storage resolution; keep test timestamps on whole millis.
    fn now() -> DateTime<Utc> {
        from_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_queue_drain_cycle() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let t0 = now();

        assert_eq!(storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap(), None);
        storage.queue_command(&sid("r1"), "first()").await.unwrap();
        storage.queue_command(&sid("r1"), "alert(1)").await.unwrap();

        assert_eq!(
            storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap().as_deref(),
            Some("alert(1)")
        );
        assert_eq!(storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_status_reports_elapsed_and_response() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let t0 = now();
        assert!(storage.read_status(&sid("r1"), t0).await.unwrap().is_none());

        storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap();
        let t1 = t0 + TimeDelta::seconds(4);
        storage.record_response(&sid("r1"), "\"done\"", t1).await.unwrap();

        let snap = storage
            .read_status(&sid("r1"), t0 + TimeDelta::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.last_seen, t0);
        assert_eq!(snap.seconds_since_seen, 10);
        assert_eq!(snap.last_response.as_deref(), Some("\"done\""));
        assert_eq!(snap.last_response_at, Some(t1));
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let t0 = now();
        let later = t0 + TimeDelta::seconds(5);

        storage.upsert_heartbeat(&sid("r1"), later).await.unwrap();
        storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap();

        let snap = storage.read_status(&sid("r1"), later).await.unwrap().unwrap();
        assert_eq!(snap.last_seen, later);
    }

    #[tokio::test]
    async fn test_concurrent_heartbeats_deliver_once() {
        let db = TempDb::new();
        let storage = SqliteStorage::connect(&db.url()).await.unwrap();
        let t0 = now();
        storage.upsert_heartbeat(&sid("r1"), t0).await.unwrap();

        for round in 0..20 {
            storage
                .queue_command(&sid("r1"), &format!("cmd({round})"))
                .await
                .unwrap();

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let storage = storage.clone();
                    let id = sid("r1");
                    tokio::spawn(async move { storage.upsert_heartbeat(&id, t0).await })
                })
                .collect();

            let mut delivered = Vec::new();
            for handle in handles {
                if let Some(command) = handle.await.unwrap().unwrap() {
                    delivered.push(command);
                }
            }
            assert_eq!(delivered, [format!("cmd({round})")]);
        }
    }

    #[tokio::test]
    async fn test_broker_over_sqlite() {
        let db = TempDb::new();
        let storage = SqliteStorage::connect(&db.url()).await.unwrap();
        let clock = Arc::new(ManualClock::new(now()));
        let broker = SessionBroker::new(storage.clone(), storage.clone())
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

        let outcome = broker.poll(AgentPoll::heartbeat("r1")).await.unwrap();
        assert_eq!(outcome.command, None);

        assert_ok!(broker.submit_command(&sid("r1"), "alert(1)").await);
        let outcome = broker.poll(AgentPoll::heartbeat("r1")).await.unwrap();
        assert_eq!(outcome.command.as_deref(), Some("alert(1)"));
        assert_eq!(broker.poll(AgentPoll::heartbeat("r1")).await.unwrap().command, None);

        let key = EncryptionKey::generate();
        storage.set_encryption_key(Some(&key.to_hex())).await.unwrap();
        broker.submit_command(&sid("r1"), "document.cookie").await.unwrap();
        let outcome = broker.poll(AgentPoll::heartbeat("r1")).await.unwrap();
        assert!(outcome.encrypted);
        let token = outcome.command.unwrap();
        assert_eq!(crypto::decrypt(&token, &key).as_deref(), Some("document.cookie"));

        clock.advance(TimeDelta::milliseconds(30_400));
        let err = assert_err!(broker.submit_command(&sid("r1"), "late()").await);
        assert!(matches!(err, BrokerError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_record_response_creates_missing_session() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let t0 = now();
        storage.record_response(&sid("late"), "x", t0).await.unwrap();

        let snap = storage.read_status(&sid("late"), t0).await.unwrap().unwrap();
        assert_eq!(snap.last_seen, t0);
        assert_eq!(snap.last_response.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_queue_to_unknown_session_fails() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let err = assert_err!(storage.queue_command(&sid("ghost"), "x").await);
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_encryption_key_setting() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.current_key().await.is_none());

        let key = EncryptionKey::generate();
        storage.set_encryption_key(Some(&key.to_hex())).await.unwrap();
        assert_eq!(storage.current_key().await, Some(key));

        storage.set_encryption_key(Some("short")).await.unwrap();
        assert_eq!(storage.encryption_key().await.unwrap().as_deref(), Some("short"));
        assert!(storage.current_key().await.is_none());

        storage.set_encryption_key(None).await.unwrap();
        assert!(storage.encryption_key().await.unwrap().is_none());
    }
}
