//! In-memory settings store.

use std::sync::RwLock;

use async_trait::async_trait;
use persist_core::traits::{SettingsStore, StorageError};

/// Settings held in process memory.
///
/// The key can be replaced at any time; the next read observes it.
#[derive(Debug, Default)]
pub struct MemorySettings {
    key: RwLock<Option<String>>,
}

impl MemorySettings {
    /// Create settings with no key configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings with an initial raw key value.
    #[must_use]
    pub fn with_key(raw: impl Into<String>) -> Self {
        Self {
            key: RwLock::new(Some(raw.into())),
        }
    }

    /// Replace or clear the stored key value.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn set_key(&self, raw: Option<String>) -> Result<(), StorageError> {
        *self
            .key
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = raw;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn encryption_key(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .key
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }
}
