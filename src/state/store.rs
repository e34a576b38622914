//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ConvergeError, Result, StateError};
use super::lock::LockInfo;
use super::types::StateDocument;

/// Trait for state storage backends.
///
/// A store holds the document of exactly one stack key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state document.
    ///
    /// Returns an empty document with version 0 if none exists yet.
    async fn load(&self) -> Result<StateDocument>;

    /// Saves the state document.
    ///
    /// The stored version must equal `state.version`, otherwise a
    /// [`StateError::Conflict`] is returned and nothing is written. On
    /// success the version is incremented in storage and in `state`.
    async fn save(&self, state: &mut StateDocument) -> Result<()>;

    /// Deletes the state document.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state for `operation`.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<StateDocument> {
        (**self).load().await
    }

    async fn save(&self, state: &mut StateDocument) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// The part of a stored document needed for the version check.
#[derive(Deserialize)]
struct VersionStamp {
    version: u64,
}

/// Reads the version stamp of a serialized document.
pub(super) fn stored_version(content: &str) -> Result<u64> {
    serde_json::from_str::<VersionStamp>(content)
        .map(|stamp| stamp.version)
        .map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read state version: {e}"),
            })
        })
}

/// Checks the stored version against the writer's and prepares the next
/// document to write.
pub(super) fn next_document(state: &StateDocument, found: u64) -> Result<StateDocument> {
    if found != state.version {
        return Err(ConvergeError::State(StateError::Conflict {
            expected: state.version,
            found,
        }));
    }
    let mut next = state.clone();
    next.version = found + 1;
    next.last_updated = chrono::Utc::now();
    Ok(next)
}

/// Serializes a document for storage.
pub(super) fn to_json(state: &StateDocument) -> Result<String> {
    serde_json::to_string_pretty(state).map_err(|e| {
        ConvergeError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}

/// Parses a stored document.
pub(super) fn from_json(content: &str) -> Result<StateDocument> {
    serde_json::from_str(content).map_err(|e| {
        ConvergeError::State(StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_document_increments_version() {
        let state = StateDocument::new("demo-dev");
        let next = next_document(&state, 0).expect("versions match");
        assert_eq!(next.version, 1);
        assert_eq!(next.stack, "demo-dev");
    }

    #[test]
    fn test_next_document_rejects_stale_writer() {
        let state = StateDocument::new("demo-dev");
        let err = next_document(&state, 3).expect_err("stale");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::Conflict { expected: 0, found: 3 })
        ));
    }

    #[test]
    fn test_stored_version() {
        let mut state = StateDocument::new("demo-dev");
        state.version = 7;
        let json = to_json(&state).expect("serialize");
        assert_eq!(stored_version(&json).expect("stamp"), 7);
        assert!(stored_version("{not json").is_err());
    }
}
