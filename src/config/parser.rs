//! Configuration parser for loading stack files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling. A mapping of the
//! form `{ from_env: NAME, default: value }` anywhere in the file is replaced
//! by the value of the environment variable at parse time.

use crate::error::{ConfigError, ConvergeError, Result};
use serde_yaml::{Mapping, Value as YamlValue};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{StackConfig, StateBackend};

/// Key marking an environment-sourced value.
const FROM_ENV_KEY: &str = "from_env";

/// Key of the fallback for an environment-sourced value.
const DEFAULT_KEY: &str = "default";

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string, reading `from_env` values
    /// from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or a required variable is unset.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        self.parse_yaml_with(content, source, &|name| std::env::var(name).ok())
    }

    /// Parses configuration from a YAML string with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or a required variable is unset.
    pub fn parse_yaml_with(
        &self,
        content: &str,
        source: Option<&Path>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");
        let location = || source.map(|p| p.display().to_string());

        let mut raw: YamlValue = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: location(),
            })
        })?;

        resolve_env_values(&mut raw, lookup)?;

        let config: StackConfig = serde_yaml::from_value(raw).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Invalid stack file: {e}"),
                location: location(),
            })
        })?;

        debug!(
            "Successfully parsed configuration for stack: {}",
            config.qualified_name()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_STACK_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;

        Self::apply_env_overrides(&mut config, &|name| std::env::var(name).ok())?;

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `CONVERGE_CONCURRENCY` is not a number.
    pub fn apply_env_overrides(
        config: &mut StackConfig,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup("CONVERGE_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            config.stack.name = name;
        }

        if let Some(env) = lookup("CONVERGE_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            config.stack.environment = env;
        }

        if let Some(endpoint) = lookup("CONVERGE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(bucket) = lookup("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
            config.state.backend = StateBackend::S3;
        }

        if let Some(prefix) = lookup("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(concurrency) = lookup("CONVERGE_CONCURRENCY") {
            debug!("Overriding execution.concurrency from environment");
            config.execution.concurrency = concurrency.trim().parse().map_err(|_| {
                ConvergeError::Config(ConfigError::validation(
                    format!("CONVERGE_CONCURRENCY must be a positive integer, got '{concurrency}'"),
                    "execution.concurrency",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider token from the variable named in the configuration.
    #[must_use]
    pub fn provider_token(config: &StackConfig) -> Option<String> {
        std::env::var(&config.provider.token_env).ok()
    }
}

/// Replaces every `{ from_env: NAME, default: value }` mapping in the tree.
fn resolve_env_values(value: &mut YamlValue, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
    let replacement = match &*value {
        YamlValue::Mapping(mapping) => env_reference(mapping, lookup)?,
        _ => None,
    };
    if let Some(resolved) = replacement {
        *value = resolved;
        return Ok(());
    }

    match value {
        YamlValue::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                resolve_env_values(item, lookup)?;
            }
            Ok(())
        }
        YamlValue::Sequence(items) => {
            for item in items {
                resolve_env_values(item, lookup)?;
            }
            Ok(())
        }
        YamlValue::Tagged(tagged) => resolve_env_values(&mut tagged.value, lookup),
        YamlValue::Null | YamlValue::Bool(_) | YamlValue::Number(_) | YamlValue::String(_) => Ok(()),
    }
}

/// Resolves a mapping that is an environment reference.
///
/// Returns `None` if the mapping is an ordinary one.
fn env_reference(
    mapping: &Mapping,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<YamlValue>> {
    let Some(YamlValue::String(name)) = mapping.get(FROM_ENV_KEY) else {
        return Ok(None);
    };
    let only_known_keys = mapping
        .keys()
        .all(|k| matches!(k.as_str(), Some(FROM_ENV_KEY | DEFAULT_KEY)));
    if !only_known_keys {
        return Ok(None);
    }

    match lookup(name) {
        Some(found) => Ok(Some(YamlValue::String(found))),
        None => mapping.get(DEFAULT_KEY).cloned().map(Some).ok_or_else(|| {
            ConvergeError::Config(ConfigError::MissingEnvVar { name: name.clone() })
        }),
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "converge.stack.yaml",
    "converge.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceId, Value};
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
stack:
  name: test-stack
";
        let config = ConfigParser::new()
            .parse_yaml_with(yaml, None, &lookup_from(&[]))
            .expect("parse");
        assert_eq!(config.stack.name, "test-stack");
        assert_eq!(config.stack.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
stack:
  name: web
  environment: prod

state:
  backend: s3
  bucket: converge-state
  prefix: web/prod

provider:
  endpoint: https://cloud.example.com/v1
  timeout_secs: 10

execution:
  concurrency: 2
  replace_strategy: create_before_destroy

replace_triggers:
  compute_instance: [image, user_data]

resources:
  - type: security_group
    name: web
    properties:
      ingress:
        - { port: 22, cidr: 0.0.0.0/0 }
        - { port: 80, cidr: 0.0.0.0/0 }
  - type: compute_instance
    name: web
    properties:
      image: ubuntu-24.04
      security_groups: [{ ref: security_group.web }]

outputs:
  public_ip:
    value: { ref: compute_instance.web, attr: public_ip }
    description: Address of the web server
";
        let config = ConfigParser::new()
            .parse_yaml_with(yaml, None, &lookup_from(&[]))
            .expect("parse");

        assert_eq!(config.qualified_name(), "web-prod");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(config.execution.max_attempts, 5);
        assert_eq!(config.resources.len(), 2);
        assert!(config.replace_triggers["compute_instance"].contains("user_data"));

        let graph = config.graph();
        assert!(graph.validate().is_ok());
        assert!(
            graph
                .dependencies(&ResourceId::new("compute_instance", "web"))
                .contains(&ResourceId::new("security_group", "web"))
        );
    }

    #[test]
    fn test_from_env_values() {
        let yaml = r"
stack:
  name: { from_env: STACK }
resources:
  - type: key_pair
    name: deploy
    properties:
      public_key: { from_env: DEPLOY_KEY }
      comment: { from_env: KEY_COMMENT, default: none }
      tags: { from_env: NOT_A_REFERENCE, env: prod }
";
        let lookup = lookup_from(&[("STACK", "demo"), ("DEPLOY_KEY", "ssh-ed25519 AAAA")]);
        let config = ConfigParser::new()
            .parse_yaml_with(yaml, None, &lookup)
            .expect("parse");

        assert_eq!(config.stack.name, "demo");
        let props = &config.resources[0].properties;
        assert_eq!(props["public_key"], Value::from("ssh-ed25519 AAAA"));
        assert_eq!(props["comment"], Value::from("none"));
        assert!(matches!(props["tags"], Value::Map(_)));
    }

    #[test]
    fn test_missing_env_value() {
        let yaml = r"
stack:
  name: demo
resources:
  - type: key_pair
    name: deploy
    properties:
      public_key: { from_env: DEPLOY_KEY }
";
        let err = ConfigParser::new()
            .parse_yaml_with(yaml, None, &lookup_from(&[]))
            .expect_err("missing variable");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::MissingEnvVar { ref name }) if name == "DEPLOY_KEY"
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml_with("stack: { name: demo }", None, &lookup_from(&[]))
            .expect("parse");

        let lookup = lookup_from(&[
            ("CONVERGE_STACK_ENVIRONMENT", "staging"),
            ("CONVERGE_STATE_BUCKET", "shared-state"),
            ("CONVERGE_CONCURRENCY", "8"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, &lookup).expect("overrides");

        assert_eq!(config.qualified_name(), "demo-staging");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("shared-state"));
        assert_eq!(config.execution.concurrency, 8);

        let bad = lookup_from(&[("CONVERGE_CONCURRENCY", "many")]);
        assert!(ConfigParser::apply_env_overrides(&mut config, &bad).is_err());
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(temp.path().join("converge.stack.yaml"), "stack: { name: x }")
            .expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("converge.stack.yaml"));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/converge.stack.yaml")
            .expect_err("missing");
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }
}
