//! Planning module for convergence runs.
//!
//! This module compares the desired graph with recorded state, orders the
//! resulting edits into a plan and executes plans against a provider.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffEngine, EditOp, FieldChange};
pub use executor::{
    ApplyReport, CancellationFlag, ExecutorSettings, PlanExecutor, RefreshReport, RetryPolicy,
};
pub use plan::{Plan, PlanStep, Planner, StepAction, StepKind};
