//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of stack configurations.
//! Maps are ordered, so the canonical JSON encoding is stable.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::spec::{ResourceConfig, StackConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of everything that shapes the desired state.
    ///
    /// Backend, provider and execution settings are excluded: moving the
    /// state or tuning retries does not change what is declared.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.stack.name.as_bytes());
        hasher.update(config.stack.environment.as_bytes());

        for resource in &config.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        update_json(&mut hasher, &config.replace_triggers);
        update_json(&mut hasher, &config.outputs);

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();
        update_json(&mut hasher, resource);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Feeds the canonical JSON encoding of `value` into the hasher.
fn update_json<T: Serialize + ?Sized>(hasher: &mut Sha256, value: &T) {
    // Plain data with string keys always serializes.
    if let Ok(bytes) = serde_json::to_vec(value) {
        hasher.update(&bytes);
    }
}
