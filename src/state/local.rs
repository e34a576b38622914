//! Local file-based state storage backend.
//!
//! This module provides a simple file-based state storage for local development
//! and single-machine use. Each stack key gets its own state and lock file in
//! the base directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, from_json, next_document, stored_version, to_json};
use super::types::StateDocument;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Stack key the store serves.
    stack_key: String,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes saves through this store.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a local state store for `stack_key` under `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, stack_key: &str) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(format!("{stack_key}.state.json"));
        let lock_path = base_dir.join(format!("{stack_key}.lock"));

        Self {
            base_dir,
            stack_key: stack_key.to_string(),
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ConvergeError::State(StateError::storage(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Reads the state file if it exists.
    async fn read_state_file(&self) -> Result<Option<String>> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&self.state_path).await.map(Some).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let mut file = fs::File::create(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateDocument> {
        match self.read_state_file().await? {
            Some(content) => {
                info!("Loading state from: {}", self.state_path.display());
                from_json(&content)
            }
            None => {
                debug!("State file does not exist: {}", self.state_path.display());
                Ok(StateDocument::new(&self.stack_key))
            }
        }
    }

    async fn save(&self, state: &mut StateDocument) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        self.ensure_dir().await?;

        let found = match self.read_state_file().await? {
            Some(content) => stored_version(&content)?,
            None => 0,
        };
        let next = next_document(state, found)?;

        debug!(
            "Saving state version {} to: {}",
            next.version,
            self.state_path.display()
        );

        let content = to_json(&next)?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            ConvergeError::State(StateError::storage(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            ConvergeError::State(StateError::storage(format!(
                "Failed to write state file: {e}"
            )))
        })?;

        file.sync_all().await.map_err(|e| {
            ConvergeError::State(StateError::storage(format!(
                "Failed to sync state file: {e}"
            )))
        })?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            ConvergeError::State(StateError::storage(format!(
                "Failed to rename state file: {e}"
            )))
        })?;

        *state = next;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                ConvergeError::State(StateError::storage(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }

        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(existing.held_error().into());
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation, &self.stack_key);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
