//! Provider interface.
//!
//! A provider turns resource specifications into real objects. The engine
//! only ever talks to the [`Provider`] trait; concrete cloud vocabulary lives
//! behind it. Adapters classify their own failures as transient, permanent
//! or not-found.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ProviderResult;
use crate::model::{ResourceId, Value};
use crate::state::Outputs;

pub use http::HttpProvider;
pub use memory::{CallKind, MemoryProvider, ProviderCall};

/// A fully resolved resource, ready to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource identity.
    pub id: ResourceId,
    /// Property values with every reference resolved.
    pub properties: BTreeMap<String, Value>,
    /// Identifies this create across retries, so a provider can drop a
    /// repeated request whose first attempt landed.
    #[serde(default)]
    pub request_id: String,
}

impl ResourceSpec {
    /// Creates a spec with a fresh request id.
    #[must_use]
    pub fn new(id: ResourceId, properties: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            properties,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// An in-place update of an existing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChanges {
    /// Resource identity.
    pub id: ResourceId,
    /// Names of the fields that changed.
    pub changed: Vec<String>,
    /// Complete desired properties with every reference resolved.
    pub properties: BTreeMap<String, Value>,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// Provider-assigned identity.
    pub provider_id: String,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
}

/// An infrastructure provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates an object.
    async fn create_resource(&self, spec: &ResourceSpec) -> ProviderResult<Created>;

    /// Updates an object in place and returns its new outputs.
    async fn update_resource(
        &self,
        provider_id: &str,
        changes: &ResourceChanges,
    ) -> ProviderResult<Outputs>;

    /// Deletes an object.
    async fn delete_resource(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()>;

    /// Reads the outputs of an object, `None` if it no longer exists.
    async fn read_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Outputs>>;

    /// Short name of the adapter, for logs.
    fn kind(&self) -> &'static str;
}
