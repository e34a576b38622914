//! Configuration specification types for a stack.
//!
//! This module defines all the structs that map to the `converge.stack.yaml` file.
//! These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Graph, Lifecycle, ReplaceStrategy, Resource, ResourceId, Value};

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack-level configuration.
    pub stack: StackInfo,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Fields that force a replacement, per resource type.
    #[serde(default)]
    pub replace_triggers: BTreeMap<String, BTreeSet<String>>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackInfo {
    /// Unique name for the stack.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Adapter to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the HTTP provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Provider adapters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON REST adapter.
    #[default]
    Http,
    /// In-process simulator (nothing outlives the process).
    Memory,
}

/// Execution tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of steps in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per step, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for retry delays, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Default replace strategy.
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique per type.
    pub name: String,
    /// Property values.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    /// Lifecycle settings.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// A stack output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Value, usually a reference.
    pub value: Value,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from("CONVERGE_PROVIDER_TOKEN")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            replace_strategy: ReplaceStrategy::default(),
        }
    }
}

impl StackConfig {
    /// Returns the stack key: name and environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.stack.name, self.stack.environment)
    }

    /// Builds the desired resource graph.
    #[must_use]
    pub fn graph(&self) -> Graph {
        Graph::new(self.resources.iter().map(ResourceConfig::to_resource).collect())
    }

    /// Returns resource ids in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(ResourceConfig::id).collect()
    }
}

impl ResourceConfig {
    /// Returns the resource identity.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Converts to a model resource.
    #[must_use]
    pub fn to_resource(&self) -> Resource {
        Resource {
            id: self.id(),
            properties: self.properties.clone(),
            depends_on: self.depends_on.iter().cloned().collect(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        let config: StackConfig = serde_yaml::from_str(
            r"
stack:
  name: web
  environment: prod
",
        )
        .expect("parse");
        assert_eq!(config.qualified_name(), "web-prod");
        assert_eq!(config.execution, ExecutionConfig::default());
        assert_eq!(config.provider.token_env, "CONVERGE_PROVIDER_TOKEN");
    }

    #[test]
    fn test_resource_to_model() {
        let yaml = r"
type: compute_instance
name: web
properties:
  image: ubuntu-24.04
  security_group: { ref: security_group.web }
depends_on: [key_pair.deploy]
lifecycle:
  replace_on: [image]
";
        let resource: ResourceConfig = serde_yaml::from_str(yaml).expect("parse");
        let model = resource.to_resource();

        assert_eq!(model.id, ResourceId::new("compute_instance", "web"));
        assert!(model.lifecycle.replace_on.contains("image"));
        let deps = model.dependencies();
        assert!(deps.contains(&ResourceId::new("security_group", "web")));
        assert!(deps.contains(&ResourceId::new("key_pair", "deploy")));
    }

    #[test]
    fn test_unknown_resource_field_is_rejected() {
        let yaml = r"
type: compute_instance
name: web
propertes: {}
";
        assert!(serde_yaml::from_str::<ResourceConfig>(yaml).is_err());
    }
}
