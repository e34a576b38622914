//! Reconciler for converging a stack to its declared state.
//!
//! This module ties the pieces of a run together: it validates the
//! declared graph, diffs it against stored state, plans the edits and
//! executes the plan while holding the state lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::error::{Result, StateError};
use crate::model::{Graph, Value};
use crate::planner::{
    ApplyReport, CancellationFlag, DiffEngine, ExecutorSettings, Plan, PlanExecutor, Planner,
    RefreshReport,
};
use crate::provider::Provider;
use crate::state::{RunOperation, StateDocument, StateStore};

/// Reconciler for one stack.
pub struct Reconciler<'a, S: StateStore> {
    /// Configuration.
    config: &'a StackConfig,
    /// State store.
    state_store: &'a S,
    /// Infrastructure provider.
    provider: Arc<dyn Provider>,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Executor settings.
    settings: ExecutorSettings,
    /// Cancellation flag handed to executors.
    cancel: CancellationFlag,
}

/// A plan together with the state it was computed against.
#[derive(Debug)]
pub struct PlannedRun {
    /// The plan.
    pub plan: Plan,
    /// State loaded for planning.
    pub state: StateDocument,
    /// Operation the plan performs.
    pub operation: RunOperation,
}

/// Summary of pending changes, for reporting.
#[derive(Debug, serde::Serialize)]
pub struct DriftReport {
    /// Whether anything would change.
    pub has_drift: bool,
    /// Resources with pending steps.
    pub changed_resources: Vec<String>,
    /// Number of declared resources.
    pub total_resources: usize,
    /// Number of recorded resources.
    pub recorded_count: usize,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a StackConfig, state_store: &'a S, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            state_store,
            provider,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new().with_replace_triggers(config.replace_triggers.clone()),
            settings: ExecutorSettings::from(&config.execution),
            cancel: CancellationFlag::new(),
        }
    }

    /// Overrides the executor settings taken from the configuration.
    #[must_use]
    pub const fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Uses `flag` to stop new steps from starting.
    #[must_use]
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Computes the plan that converges the stack to its configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the graph is invalid, or a state error
    /// if state cannot be loaded.
    pub async fn plan(&self) -> Result<PlannedRun> {
        info!("Planning {}", self.config.qualified_name());
        let graph = self.config.graph();
        graph.validate()?;

        let state = self.state_store.load().await?;
        let hash = self.hasher.hash_config(self.config);
        self.plan_against(&graph, state, hash, RunOperation::Apply)
    }

    /// Computes the plan that deletes every recorded object.
    ///
    /// # Errors
    ///
    /// Returns a state error if state cannot be loaded.
    pub async fn plan_destroy(&self) -> Result<PlannedRun> {
        info!("Planning destruction of {}", self.config.qualified_name());
        let state = self.state_store.load().await?;
        self.plan_against(&Graph::empty(), state, String::new(), RunOperation::Destroy)
    }

    fn plan_against(
        &self,
        graph: &Graph,
        state: StateDocument,
        hash: String,
        operation: RunOperation,
    ) -> Result<PlannedRun> {
        let ops = self.diff_engine.diff(graph, &state)?;
        let plan = Planner::new(self.config.execution.replace_strategy)
            .based_on(state.version, hash)
            .plan(ops, graph)?;

        info!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            plan.create_count(),
            plan.update_count(),
            plan.replace_count(),
            plan.delete_count()
        );

        Ok(PlannedRun {
            plan,
            state,
            operation,
        })
    }

    /// Executes a planned run while holding the state lock.
    ///
    /// An empty plan whose configuration hash is already recorded is a
    /// no-op and touches neither the lock nor the state.
    ///
    /// # Errors
    ///
    /// Returns a lock error, a state conflict or an execution error.
    pub async fn execute(&self, run: PlannedRun) -> Result<ApplyReport> {
        let PlannedRun {
            plan,
            state,
            operation,
        } = run;

        if plan.is_empty() && plan.config_hash == state.config_hash {
            info!("No changes required - state is converged");
            return Ok(ApplyReport {
                succeeded: 0,
                created: 0,
                updated: 0,
                deleted: 0,
                state,
                duration: std::time::Duration::ZERO,
            });
        }

        let lock = self
            .state_store
            .acquire_lock("", &operation.to_string())
            .await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = match self.state_store.load().await {
            Ok(current) if current.version != plan.base_version => {
                warn!(
                    "State moved from version {} to {} since planning",
                    plan.base_version, current.version
                );
                Err(StateError::Conflict {
                    expected: plan.base_version,
                    found: current.version,
                }
                .into())
            }
            Ok(current) => {
                PlanExecutor::new(Arc::clone(&self.provider), self.state_store)
                    .with_settings(self.settings)
                    .with_cancellation(self.cancel.clone())
                    .for_operation(operation)
                    .apply(plan, current)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    /// Plans and executes a convergence run.
    ///
    /// # Errors
    ///
    /// See [`Self::plan`] and [`Self::execute`].
    pub async fn apply(&self) -> Result<ApplyReport> {
        let run = self.plan().await?;
        self.execute(run).await
    }

    /// Plans and executes the deletion of every recorded object.
    ///
    /// # Errors
    ///
    /// See [`Self::plan_destroy`] and [`Self::execute`].
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let run = self.plan_destroy().await?;
        self.execute(run).await
    }

    /// Re-reads every recorded object from the provider.
    ///
    /// # Errors
    ///
    /// Returns a lock, state or provider error.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let lock = self
            .state_store
            .acquire_lock("", &RunOperation::Refresh.to_string())
            .await?;

        let result = match self.state_store.load().await {
            Ok(state) => {
                PlanExecutor::new(Arc::clone(&self.provider), self.state_store)
                    .with_settings(self.settings)
                    .for_operation(RunOperation::Refresh)
                    .refresh(state)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    /// Summarizes what a plan would change.
    ///
    /// # Errors
    ///
    /// See [`Self::plan`].
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let run = self.plan().await?;
        let changed: BTreeSet<String> = run
            .plan
            .steps
            .iter()
            .map(|s| s.resource.to_string())
            .collect();

        Ok(DriftReport {
            has_drift: !run.plan.is_empty(),
            changed_resources: changed.into_iter().collect(),
            total_resources: self.config.resources.len(),
            recorded_count: run.state.records.len(),
        })
    }

    /// Resolves the declared stack outputs against `state`.
    ///
    /// Outputs whose references cannot be resolved yet map to `None`.
    #[must_use]
    pub fn outputs(&self, state: &StateDocument) -> BTreeMap<String, Option<Value>> {
        let lookup = |r: &crate::model::Reference| state.resolve_reference(r);
        self.config
            .outputs
            .iter()
            .map(|(name, output)| (name.clone(), output.value.resolve(&lookup).ok()))
            .collect()
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Pending changes:")?;
            for resource in &self.changed_resources {
                writeln!(f, "  - {resource}")?;
            }
        } else {
            write!(f, "No changes - state is converged")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ConvergeError, EXIT_VALIDATION, ValidationError};
    use crate::model::ResourceId;
    use crate::planner::{RetryPolicy, StepAction};
    use crate::provider::{CallKind, MemoryProvider};
    use crate::state::{LocalStateStore, Outputs};
    use std::time::Duration;
    use tempfile::TempDir;

    const STACK: &str = r"
stack: { name: web, environment: test }
provider: { kind: memory }
resources:
  - type: network
    name: main
    properties: { cidr: 10.0.0.0/16 }
  - type: vm
    name: web
    properties:
      network: { ref: network.main }
      image: ubuntu-24.04
    lifecycle: { replace_on: [image] }
outputs:
  web_ip:
    value: { ref: vm.web, attr: public_ip }
";

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new()
            .parse_yaml_with(yaml, None, &|_| None)
            .expect("parse")
    }

    fn fast() -> ExecutorSettings {
        ExecutorSettings {
            concurrency: 2,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    fn provider() -> Arc<MemoryProvider> {
        let mut outputs = Outputs::new();
        outputs.insert(String::from("public_ip"), Value::from("203.0.113.10"));
        Arc::new(MemoryProvider::new().with_outputs("vm", outputs))
    }

    #[tokio::test]
    async fn test_apply_converges() {
        let dir = TempDir::new().expect("tempdir");
        let config = parse(STACK);
        let store = LocalStateStore::new(dir.path(), &config.qualified_name());
        let provider = provider();
        let reconciler = Reconciler::new(&config, &store, provider.clone()).with_settings(fast());

        let report = reconciler.apply().await.expect("apply");
        assert_eq!(report.created, 2);
        assert!(!store.is_locked().await.expect("lock check"));

        let drift = reconciler.check_drift().await.expect("drift");
        assert!(drift.is_converged());

        let second = reconciler.apply().await.expect("second apply");
        assert_eq!(second.succeeded, 0);
        assert_eq!(provider.call_count(CallKind::Create), 2);

        let outputs = reconciler.outputs(&second.state);
        assert_eq!(outputs["web_ip"], Some(Value::from("203.0.113.10")));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_call() {
        let dir = TempDir::new().expect("tempdir");
        let config = parse(
            r"
stack: { name: loop }
resources:
  - type: vm
    name: a
    depends_on: [vm.b]
  - type: vm
    name: b
    properties: { peer: { ref: vm.a } }
",
        );
        let store = LocalStateStore::new(dir.path(), &config.qualified_name());
        let provider = provider();
        let reconciler = Reconciler::new(&config, &store, provider.clone());

        let err = reconciler.apply().await.expect_err("cycle");
        assert!(matches!(
            err,
            ConvergeError::Validation(ValidationError::Cycle { .. })
        ));
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replacement_then_destroy() {
        let dir = TempDir::new().expect("tempdir");
        let config = parse(STACK);
        let store = LocalStateStore::new(dir.path(), &config.qualified_name());
        let provider = provider();
        Reconciler::new(&config, &store, provider.clone())
            .with_settings(fast())
            .apply()
            .await
            .expect("apply");

        let changed = parse(&STACK.replace("ubuntu-24.04", "debian-13"));
        let reconciler = Reconciler::new(&changed, &store, provider.clone()).with_settings(fast());
        let run = reconciler.plan().await.expect("plan");
        assert_eq!(run.plan.replace_count(), 1);
        let report = reconciler.execute(run).await.expect("replace");
        assert_eq!(report.created, 1);
        assert_eq!(report.deleted, 1);

        let run = reconciler.plan_destroy().await.expect("destroy plan");
        let web = ResourceId::new("vm", "web");
        let network = ResourceId::new("network", "main");
        let web_delete = run.plan.find(&web, StepAction::Delete).expect("web").index;
        let network_delete = run.plan.find(&network, StepAction::Delete).expect("net").index;
        assert!(web_delete < network_delete);

        let report = reconciler.execute(run).await.expect("destroy");
        assert_eq!(report.deleted, 2);
        assert!(report.state.is_empty());
        assert_eq!(provider.object_count(), 0);
        assert!(report.state.config_hash.is_empty());
    }

    #[tokio::test]
    async fn test_plan_made_stale_by_another_run_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let one = parse("stack: { name: b, environment: test }\nresources:\n  - { type: bucket, name: a }\n");
        let two = parse(
            "stack: { name: b, environment: test }\nresources:\n  - { type: bucket, name: a }\n  - { type: bucket, name: z }\n",
        );
        let store = LocalStateStore::new(dir.path(), &one.qualified_name());
        let provider = provider();

        let first = Reconciler::new(&one, &store, provider.clone()).with_settings(fast());
        let stale = first.plan().await.expect("plan");

        Reconciler::new(&two, &store, provider.clone())
            .with_settings(fast())
            .apply()
            .await
            .expect("concurrent apply");
        let creates = provider.call_count(CallKind::Create);

        let err = first.execute(stale).await.expect_err("stale plan");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::Conflict { expected: 0, .. })
        ));
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
        assert_eq!(provider.call_count(CallKind::Create), creates);
        assert_eq!(provider.object_count(), 2);
        assert!(!store.is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_drift_lists_each_resource_once() {
        let dir = TempDir::new().expect("tempdir");
        let yaml = r"
stack: { name: pair, environment: test }
resources:
  - { type: vm, name: api, properties: { image: v1 }, lifecycle: { replace_on: [image] } }
  - { type: vm, name: web, properties: { image: v1 }, lifecycle: { replace_on: [image] } }
";
        let config = parse(yaml);
        let store = LocalStateStore::new(dir.path(), &config.qualified_name());
        let provider = provider();
        Reconciler::new(&config, &store, provider.clone())
            .apply()
            .await
            .expect("apply");

        let changed = parse(&yaml.replace("v1", "v2"));
        let drift = Reconciler::new(&changed, &store, provider)
            .check_drift()
            .await
            .expect("drift");

        assert!(drift.has_drift);
        assert_eq!(drift.changed_resources, vec!["vm.api", "vm.web"]);
    }
}
