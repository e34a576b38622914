//! Error types for the convergence engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, graph validation, state storage, provider calls,
//! planning and execution.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::ResourceId;
use crate::planner::StepAction;
use crate::state::StateDocument;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph validation errors.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of plan execution.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Plan execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Resource graph validation errors.
///
/// These are fatal and raised before anything is applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two resources share the same identity.
    #[error("Duplicate resource: {id}")]
    DuplicateResource {
        /// The duplicated identity.
        id: ResourceId,
    },

    /// A reference or explicit dependency points at an undeclared resource.
    #[error("{source_id} ({field}) references undeclared resource {target}")]
    UnresolvedReference {
        /// Resource holding the reference.
        source_id: ResourceId,
        /// Property (or `depends_on`) holding the reference.
        field: String,
        /// The missing target.
        target: ResourceId,
    },

    /// The dependency edges contain a cycle.
    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    Cycle {
        /// Resources on the cycle, first element repeated at the end.
        cycle: Vec<ResourceId>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The stored document was written by someone else since it was loaded.
    #[error("State conflict: expected version {expected}, found {found}")]
    Conflict {
        /// Version the writer based its changes on.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, operation: {operation}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// Operation the holder is running.
        operation: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local storage I/O failed.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Errors reported by a provider adapter.
///
/// The adapter decides whether a failure is transient; the engine never
/// guesses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A failure expected to resolve itself (rate limit, timeout, outage).
    #[error("transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Delay the provider asked for before retrying.
        retry_after: Option<Duration>,
    },

    /// A failure that will not go away by retrying (invalid configuration).
    #[error("provider rejected the request: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The provider has no object with this identity.
    #[error("provider object not found: {provider_id}")]
    NotFound {
        /// Provider-assigned identity that was looked up.
        provider_id: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No execution order satisfies the step dependencies.
    #[error("No valid execution order for steps: {}", .steps.join(", "))]
    Unplannable {
        /// Steps left over after topological sorting.
        steps: Vec<String>,
    },
}

/// Plan execution errors.
///
/// Every variant carries the state actually achieved; it has already been
/// persisted when the error is returned.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A step reached its terminal failed state.
    #[error("{action} of {resource} failed after {attempts} attempt(s): {source}")]
    StepFailed {
        /// Resource the step acted on.
        resource: ResourceId,
        /// Phase of the failed step.
        action: StepAction,
        /// Attempts made, including retries.
        attempts: u32,
        /// Final provider error.
        source: ProviderError,
        /// Steps that succeeded during this run.
        succeeded: usize,
        /// State reached before halting.
        partial: Box<StateDocument>,
    },

    /// A reference could not be resolved against the state of a dependency.
    #[error("{action} of {resource} cannot resolve {field}: {target} has no output '{attr}'")]
    UnresolvedOutput {
        /// Resource the step acted on.
        resource: ResourceId,
        /// Phase of the failed step.
        action: StepAction,
        /// Property holding the reference.
        field: String,
        /// Referenced resource.
        target: ResourceId,
        /// Referenced output.
        attr: String,
        /// Steps that succeeded during this run.
        succeeded: usize,
        /// State reached before halting.
        partial: Box<StateDocument>,
    },

    /// A step task aborted without reporting a result.
    #[error("A step aborted unexpectedly: {message}")]
    Aborted {
        /// Panic or join failure reported by the runtime.
        message: String,
        /// Steps that succeeded during this run.
        succeeded: usize,
        /// State reached before halting.
        partial: Box<StateDocument>,
    },

    /// The run was cancelled before all steps started.
    #[error("Apply cancelled: {succeeded} step(s) succeeded, {not_started} not started")]
    Cancelled {
        /// Steps that succeeded during this run.
        succeeded: usize,
        /// Steps never started.
        not_started: usize,
        /// State reached before halting.
        partial: Box<StateDocument>,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Exit code for success.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for validation and configuration errors.
pub const EXIT_VALIDATION: u8 = 1;

/// Exit code for an apply that stopped part-way.
pub const EXIT_PARTIAL_APPLY: u8 = 2;

/// Exit code for provider or network failures.
pub const EXIT_PROVIDER: u8 = 3;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the CLI exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Validation(_) | Self::Plan(_) => EXIT_VALIDATION,
            Self::State(
                StateError::Conflict { .. }
                | StateError::LockedByOther { .. }
                | StateError::Corrupted { .. },
            ) => EXIT_VALIDATION,
            Self::Execution(err) => {
                if err.succeeded() == 0 && !matches!(err, ExecutionError::Cancelled { .. }) {
                    EXIT_PROVIDER
                } else {
                    EXIT_PARTIAL_APPLY
                }
            }
            Self::State(_) | Self::Provider(_) | Self::Io(_) | Self::Internal(_) => EXIT_PROVIDER,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl ExecutionError {
    /// Returns the state reached before the run stopped.
    #[must_use]
    pub fn partial_state(&self) -> &StateDocument {
        match self {
            Self::StepFailed { partial, .. }
            | Self::UnresolvedOutput { partial, .. }
            | Self::Aborted { partial, .. }
            | Self::Cancelled { partial, .. } => partial,
        }
    }

    /// Returns the number of steps that succeeded before the run stopped.
    #[must_use]
    pub const fn succeeded(&self) -> usize {
        match self {
            Self::StepFailed { succeeded, .. }
            | Self::UnresolvedOutput { succeeded, .. }
            | Self::Aborted { succeeded, .. }
            | Self::Cancelled { succeeded, .. } => *succeeded,
        }
    }
}

fn format_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = ValidationError::Cycle {
            cycle: vec![
                ResourceId::new("vm", "a"),
                ResourceId::new("vm", "b"),
                ResourceId::new("vm", "a"),
            ],
        };
        assert_eq!(err.to_string(), "Dependency cycle: vm.a -> vm.b -> vm.a");
    }

    #[test]
    fn test_exit_codes() {
        let validation = ConvergeError::from(ValidationError::DuplicateResource {
            id: ResourceId::new("vm", "a"),
        });
        assert_eq!(validation.exit_code(), EXIT_VALIDATION);

        let conflict = ConvergeError::from(StateError::Conflict { expected: 1, found: 2 });
        assert_eq!(conflict.exit_code(), EXIT_VALIDATION);

        let provider = ConvergeError::from(ProviderError::transient("timeout"));
        assert_eq!(provider.exit_code(), EXIT_PROVIDER);

        let partial = ConvergeError::from(ExecutionError::Cancelled {
            succeeded: 0,
            not_started: 3,
            partial: Box::new(StateDocument::new("demo-dev")),
        });
        assert_eq!(partial.exit_code(), EXIT_PARTIAL_APPLY);
    }

    #[test]
    fn test_retry_hint() {
        let err = ProviderError::Transient {
            message: String::from("slow down"),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(!ProviderError::permanent("bad").is_transient());
    }
}
