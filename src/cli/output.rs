//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::error::{ConvergeError, ExecutionError};
use crate::model::Value;
use crate::planner::{ApplyReport, Plan, PlanStep, RefreshReport, StepAction, StepKind};
use crate::reconciler::DriftReport;
use crate::state::{LockInfo, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the selected output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution Plan\n");
        let _ = write!(
            output,
            "   Config hash: {}\n   Based on state version: {}\n\n",
            short(&plan.config_hash),
            plan.base_version
        );

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .map(|s| PlanStepRow {
                index: s.index + 1,
                wave: s.wave + 1,
                action: Self::format_action(s),
                resource: s.resource.to_string(),
                reason: Self::truncate(&s.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for step in &plan.steps {
                if let StepKind::Update { changes, .. } = &step.kind {
                    let _ = writeln!(output, "   {}:", step.resource);
                    for change in changes {
                        let _ = writeln!(output, "     {change}");
                    }
                }
                if let StepKind::Create {
                    deposes: Some(old), ..
                } = &step.kind
                {
                    let _ = writeln!(
                        output,
                        "   {}: new object created before {old} is deleted",
                        step.resource
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().yellow(),
            plan.delete_count().to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "status": "success",
                "succeeded": report.succeeded,
                "created": report.created,
                "updated": report.updated,
                "deleted": report.deleted,
                "state_version": report.state.version,
                "duration_ms": u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Apply complete\n\n", "✓".green());
                let _ = writeln!(output, "   Created: {}", report.created);
                let _ = writeln!(output, "   Updated: {}", report.updated);
                let _ = writeln!(output, "   Deleted: {}", report.deleted);
                let _ = writeln!(output, "   State version: {}", report.state.version);
                let _ = writeln!(output, "   Duration: {:.1}s", report.duration.as_secs_f64());
                output
            }
        }
    }

    /// Formats a refresh result.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        let names = |ids: &[crate::model::ResourceId]| {
            ids.iter().map(ToString::to_string).collect::<Vec<_>>()
        };
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "updated": names(&report.updated),
                "removed": names(&report.removed),
                "state_version": report.state.version,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Refresh complete\n", "✓".green());
                for id in &report.updated {
                    let _ = writeln!(output, "   {} {id} (outputs changed)", "~".yellow());
                }
                for id in &report.removed {
                    let _ = writeln!(output, "   {} {id} (no longer exists)", "-".red());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Pending changes:\n\n", "⚠".yellow());
                    for resource in &report.changed_resources {
                        let _ = writeln!(output, "   - {resource}");
                    }
                    let _ = write!(
                        output,
                        "\n{} resource(s) affected; {} declared, {} recorded.\n",
                        report.changed_resources.len(),
                        report.total_resources,
                        report.recorded_count
                    );
                    output
                }
            }
        }
    }

    /// Formats the stored state.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.stack);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.records.len());

                if !state.records.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            resource: r.id.to_string(),
                            provider_id: r.provider_id.clone(),
                            depends_on: r
                                .dependencies
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.deposed.is_empty() {
                    let _ = write!(output, "\n{} Deposed objects awaiting deletion:\n", "⚠".yellow());
                    for object in &state.deposed {
                        let _ = writeln!(output, "   - {} ({})", object.id, object.provider_id);
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = write!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = write!(output, ": {error}");
                        }
                        output.push('\n');
                    }
                }

                output
            }
        }
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Option<Value>>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs declared.\n");
                }
                let mut output = String::new();
                for (name, value) in outputs {
                    match value {
                        Some(value) => {
                            let _ = writeln!(output, "{name} = {value}");
                        }
                        None => {
                            let _ = writeln!(output, "{name} = {}", "(not yet known)".dimmed());
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    let mut text = format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(text, "   - {error}");
                    }
                    text
                };
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, lock) => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            (OutputFormat::Text, None) => String::from("State is not locked.\n"),
            (OutputFormat::Text, Some(lock)) => format!(
                "State locked by {} for {} (lock id {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a command failure, including what a partial run achieved.
    #[must_use]
    pub fn format_error(&self, error: &ConvergeError) -> String {
        let partial = match error {
            ConvergeError::Execution(e) => Some(e),
            _ => None,
        };

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "status": "error",
                "message": error.to_string(),
                "exit_code": error.exit_code(),
                "succeeded_steps": partial.map(ExecutionError::succeeded),
                "state_version": partial.map(|e| e.partial_state().version),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} {error}\n", "✗".red());
                if let Some(e) = partial {
                    let state = e.partial_state();
                    let _ = write!(
                        output,
                        "\n{} {} step(s) succeeded before the run stopped; state version {} records {} resource(s).\n",
                        "⚠".yellow(),
                        e.succeeded(),
                        state.version,
                        state.records.len()
                    );
                    output.push_str("   Run apply again to converge the remainder.\n");
                }
                output
            }
        }
    }

    /// Formats a step action with color.
    fn format_action(step: &PlanStep) -> String {
        match (step.action(), step.replacement) {
            (StepAction::Create, false) => "+create".green().to_string(),
            (StepAction::Create, true) => "+/-create".yellow().to_string(),
            (StepAction::Update, _) => "~update".yellow().to_string(),
            (StepAction::Delete, false) => "-delete".red().to_string(),
            (StepAction::Delete, true) => "-/+delete".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    config_hash: String,
    base_version: u64,
    step_count: usize,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    steps: Vec<StepJson>,
}

#[derive(serde::Serialize)]
struct StepJson {
    index: usize,
    wave: usize,
    action: String,
    resource: String,
    replacement: bool,
    reason: String,
    depends_on: Vec<usize>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            base_version: plan.base_version,
            step_count: plan.step_count(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            replaces: plan.replace_count(),
            deletes: plan.delete_count(),
            steps: plan
                .steps
                .iter()
                .map(|s| StepJson {
                    index: s.index,
                    wave: s.wave,
                    action: s.action().to_string(),
                    resource: s.resource.to_string(),
                    replacement: s.replacement,
                    reason: s.reason.clone(),
                    depends_on: s.depends_on.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Graph, Resource, ResourceId};
    use crate::planner::{EditOp, Planner};
    use crate::model::ReplaceStrategy;

    fn sample_plan() -> Plan {
        let a = Resource::new(ResourceId::new("vm", "a"));
        Planner::new(ReplaceStrategy::DestroyBeforeCreate)
            .based_on(0, "0123456789abcdef")
            .plan(vec![EditOp::Create { resource: a.clone() }], &Graph::new(vec![a]))
            .expect("plan")
    }

    #[test]
    fn test_plan_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_plan(&sample_plan(), false)).expect("json");
        assert_eq!(json["creates"], 1);
        assert_eq!(json["steps"][0]["resource"], "vm.a");
        assert_eq!(json["steps"][0]["action"], "create");
    }

    #[test]
    fn test_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&sample_plan(), true);
        assert!(text.contains("01234567"));
        assert!(text.contains("vm.a"));
        assert!(formatter
            .format_plan(&Plan::empty(0, ""), false)
            .contains("No changes required"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
