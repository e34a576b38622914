//! S3-based state storage backend.
//!
//! This module provides a remote state storage using AWS S3 (or compatible services)
//! for shared stacks. The version stamp check is read-then-write; concurrent
//! processes are kept apart by the lock object.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, from_json, next_document, stored_version, to_json};
use super::types::StateDocument;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix (empty or ending with `/`).
    prefix: String,
    /// Stack key the store serves.
    stack_key: String,
    /// Serializes saves through this store.
    write_guard: Mutex<()>,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        stack_key: &str,
    ) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, stack_key))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, stack_key: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            stack_key: stack_key.to_string(),
            write_guard: Mutex::new(()),
        }
    }

    /// Key of the state object.
    fn state_key(&self) -> String {
        format!("{}{}.state.json", self.prefix, self.stack_key)
    }

    /// Key of the lock object.
    fn lock_key(&self) -> String {
        format!("{}{}.lock", self.prefix, self.stack_key)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(ConvergeError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }
}

/// Normalizes a key prefix to be empty or end with a single `/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

/// Parses a stored lock object.
fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        ConvergeError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateDocument> {
        let key = self.state_key();
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = from_json(&json)?;
                info!("Loaded state for stack {} (version {})", state.stack, state.version);
                Ok(state)
            }
            None => {
                debug!("No state found in S3");
                Ok(StateDocument::new(&self.stack_key))
            }
        }
    }

    async fn save(&self, state: &mut StateDocument) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let key = self.state_key();

        let found = match self.get_object(&key).await? {
            Some(content) => stored_version(&content)?,
            None => 0,
        };
        let next = next_document(state, found)?;

        debug!("Saving state version {} to s3://{}/{key}", next.version, self.bucket);
        self.put_object(&key, &to_json(&next)?).await?;

        *state = next;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.state_key();
        let lock_key = self.lock_key();

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.state_key()).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = parse_lock(&content)?;
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

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        self.put_object(&key, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        self.delete_object(&self.lock_key()).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key()).await? {
            Some(content) => parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks")), "stacks/");
        assert_eq!(normalize_prefix(Some("/teams/infra/")), "teams/infra/");
    }

    #[test]
    fn test_parse_lock() {
        let lock = LockInfo::new("ci-runner", "apply", "demo-prod");
        let json = serde_json::to_string(&lock).expect("serialize");
        assert_eq!(parse_lock(&json).expect("parse"), lock);
        assert!(parse_lock("[]").is_err());
    }
}
