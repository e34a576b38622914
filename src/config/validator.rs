//! Configuration validation for stack files.
//!
//! This module checks configuration values before any planning happens.
//! Graph-level checks (duplicates, references, cycles) belong to
//! [`crate::model::Graph::validate`]; this validator covers naming, backend
//! settings, execution tuning and stack outputs.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ExecutionConfig, ProviderConfig, ProviderKind, ResourceConfig, StackConfig, StackInfo,
    StateBackend, StateConfig,
};

/// Concurrency above which a warning is emitted.
const HIGH_CONCURRENCY: usize = 64;

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<FieldError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct FieldError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings are returned on success.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(&config.stack, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_replace_triggers(config, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    /// Validates stack identity.
    fn validate_stack(stack: &StackInfo, result: &mut ValidationResult) {
        if stack.name.is_empty() {
            result.error("stack.name", "Stack name cannot be empty");
        } else if !is_valid_name(&stack.name) {
            result.error(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.name
                ),
            );
        }

        if stack.environment.is_empty() {
            result.error("stack.environment", "Environment cannot be empty");
        } else if !is_valid_name(&stack.environment) {
            result.error(
                "stack.environment",
                format!(
                    "Environment '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.environment
                ),
            );
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error(
                        "provider.endpoint",
                        "Provider endpoint is required for the http provider",
                    );
                }
                Some(endpoint)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    result.error(
                        "provider.endpoint",
                        format!("Provider endpoint '{endpoint}' must be an http(s) URL"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Memory => {
                result.warnings.push(String::from(
                    "provider.kind: memory objects do not outlive the process",
                ));
            }
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    /// Validates execution tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.error("execution.concurrency", "Concurrency must be at least 1");
        } else if execution.concurrency > HIGH_CONCURRENCY {
            result.warnings.push(format!(
                "execution.concurrency: {} concurrent steps may trip provider rate limits",
                execution.concurrency
            ));
        }

        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "At least one attempt is required");
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.error(
                "execution.initial_backoff_ms",
                "Initial backoff cannot exceed max_backoff_ms",
            );
        }
    }

    /// Validates resource identities and lifecycles.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_type(&resource.resource_type) {
                result.error(
                    format!("{prefix}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must be lowercase alphanumeric with underscores, starting with a letter.",
                        resource.resource_type
                    ),
                );
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            for field in resource
                .lifecycle
                .replace_on
                .intersection(&resource.lifecycle.ignore_changes)
            {
                result.warnings.push(format!(
                    "{prefix}.lifecycle: '{field}' is ignored and can never trigger a replacement"
                ));
            }
        }
    }

    /// Warns about replacement triggers for undeclared types.
    fn validate_replace_triggers(config: &StackConfig, result: &mut ValidationResult) {
        let declared: HashSet<&str> = config
            .resources
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect();

        for resource_type in config.replace_triggers.keys() {
            if !declared.contains(resource_type.as_str()) {
                result.warnings.push(format!(
                    "replace_triggers.{resource_type}: no resource of this type is declared"
                ));
            }
        }
    }

    /// Validates that outputs only reference declared resources.
    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        let declared: HashSet<_> = config.resource_ids().into_iter().collect();

        for (name, output) in &config.outputs {
            if name.is_empty() {
                result.error("outputs", "Output name cannot be empty");
            }

            let mut refs = Vec::new();
            output.value.collect_references(&mut refs);
            for reference in refs {
                if !declared.contains(&reference.target) {
                    result.error(
                        format!("outputs.{name}.value"),
                        format!("Output '{name}' references undeclared resource {}", reference.target),
                    );
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a resource type: `[a-z][a-z0-9_]*`.
fn is_valid_type(resource_type: &str) -> bool {
    let mut chars = resource_type.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
