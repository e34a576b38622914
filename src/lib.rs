// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Converge
//!
//! A declarative infrastructure convergence engine.
//!
//! ## Overview
//!
//! Converge reads a stack file describing the resources you want, compares it
//! with what it last recorded, and drives a provider until reality matches:
//!
//! - Resources reference each other's outputs (`{ ref: vm.web, attr: public_ip }`)
//! - Changes are planned as a dependency-ordered graph of steps
//! - Independent steps run concurrently with bounded retries
//! - State is saved after every successful step, so a failed apply resumes
//!
//! ## Architecture
//!
//! 1. **Desired State**: the resource graph in `converge.stack.yaml`
//! 2. **Recorded State**: the versioned state document
//! 3. **Diff**: field-level edit operations between the two
//! 4. **Plan**: ordered steps with `Replace` split into create and delete
//! 5. **Executor**: runs the plan against a [`Provider`]
//!
//! ## Modules
//!
//! - [`model`]: Resource identities, values, references and the graph
//! - [`config`]: Stack file parsing and validation
//! - [`state`]: State document and storage backends (local, S3)
//! - [`provider`]: Provider interface and adapters
//! - [`planner`]: Diff computation, planning and execution
//! - [`reconciler`]: High-level plan/apply/destroy orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: web
//!   environment: dev
//!
//! resources:
//!   - type: network
//!     name: main
//!     properties:
//!       cidr: 10.0.0.0/16
//!   - type: vm
//!     name: web
//!     properties:
//!       image: ubuntu-24.04
//!       network: { ref: network.main }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{ConvergeError, Result};
pub use model::{Graph, Resource, ResourceId, Value};
pub use planner::{DiffEngine, Plan, PlanExecutor, Planner};
pub use provider::{HttpProvider, MemoryProvider, Provider};
pub use reconciler::{DriftReport, PlannedRun, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateDocument, StateStore};
