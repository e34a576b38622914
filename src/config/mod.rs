//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.stack.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ExecutionConfig, OutputConfig, ProviderConfig, ProviderKind, ResourceConfig, StackConfig,
    StackInfo, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, FieldError, ValidationResult};
