//! Plan executor for applying execution plans.
//!
//! Steps run on a bounded worker pool. A step starts only once every step
//! it depends on has succeeded. Transient provider errors are retried with
//! exponential backoff. The first terminal failure stops new steps from
//! starting; steps already in flight are allowed to finish. Every success
//! is checkpointed to the state store, so a failed run leaves behind
//! exactly what it achieved.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ConvergeError, ExecutionError, ProviderError, ProviderResult, Result, StateError};
use crate::model::{Reference, Resource, ResourceId, Value};
use crate::provider::{Created, Provider, ResourceChanges, ResourceSpec};
use crate::state::{Outputs, RunHistoryEntry, RunOperation, StateDocument, StateRecord, StateStore};

use super::plan::{Plan, PlanStep, StepAction, StepKind};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retrying after failed attempt `attempt`.
    ///
    /// A delay requested by the provider takes precedence over the
    /// computed one. Both are capped at `max_backoff`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_backoff);
        }
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Executor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum number of steps in flight.
    pub concurrency: usize,
    /// Retry policy for transient errors.
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ExecutionConfig> for ExecutorSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
        }
    }
}

/// Shared flag that stops new steps from starting.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed apply.
#[derive(Debug)]
pub struct ApplyReport {
    /// Steps that succeeded.
    pub succeeded: usize,
    /// Objects created.
    pub created: usize,
    /// Objects updated in place.
    pub updated: usize,
    /// Objects deleted.
    pub deleted: usize,
    /// Persisted state after the run.
    pub state: StateDocument,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Result of a refresh.
#[derive(Debug)]
pub struct RefreshReport {
    /// Records whose outputs changed.
    pub updated: Vec<ResourceId>,
    /// Records dropped because the object no longer exists.
    pub removed: Vec<ResourceId>,
    /// Persisted state after the refresh.
    pub state: StateDocument,
}

/// Executor for plans.
pub struct PlanExecutor<'a> {
    provider: Arc<dyn Provider>,
    store: &'a dyn StateStore,
    settings: ExecutorSettings,
    cancel: CancellationFlag,
    operation: RunOperation,
}

impl std::fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.kind())
            .field("store", &self.store.backend_type())
            .field("settings", &self.settings)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// A provider call with every reference resolved.
#[derive(Debug)]
enum Call {
    Create(ResourceSpec),
    Update {
        provider_id: String,
        changes: ResourceChanges,
    },
    Delete {
        resource_type: String,
        provider_id: String,
    },
    Read {
        resource_type: String,
        provider_id: String,
    },
    /// State-only update: nothing is sent to the provider.
    Keep(Outputs),
}

#[derive(Debug)]
enum Outcome {
    Created(Created),
    Updated(Outputs),
    Deleted,
    Read(Option<Outputs>),
}

/// Why a run stopped launching steps.
#[derive(Debug)]
enum Halt {
    Step {
        index: usize,
        attempts: u32,
        error: ProviderError,
    },
    Unresolved {
        index: usize,
        field: String,
        reference: Reference,
    },
    Store(ConvergeError),
    Aborted(String),
}

type StepResult = (usize, u32, ProviderResult<Outcome>);

impl Call {
    async fn invoke(&self, provider: &dyn Provider) -> ProviderResult<Outcome> {
        match self {
            Self::Create(spec) => provider.create_resource(spec).await.map(Outcome::Created),
            Self::Update {
                provider_id,
                changes,
            } => provider
                .update_resource(provider_id, changes)
                .await
                .map(Outcome::Updated),
            Self::Delete {
                resource_type,
                provider_id,
            } => match provider.delete_resource(resource_type, provider_id).await {
                Ok(()) => Ok(Outcome::Deleted),
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{provider_id} was already deleted");
                    Ok(Outcome::Deleted)
                }
                Err(e) => Err(e),
            },
            Self::Keep(outputs) => Ok(Outcome::Updated(outputs.clone())),
            Self::Read {
                resource_type,
                provider_id,
            } => provider
                .read_resource(resource_type, provider_id)
                .await
                .map(Outcome::Read),
        }
    }
}

/// Runs `call`, retrying transient errors. Returns the attempts made.
async fn run_with_retry(
    provider: &dyn Provider,
    call: &Call,
    retry: RetryPolicy,
    label: &str,
) -> (u32, ProviderResult<Outcome>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call.invoke(provider).await {
            Ok(outcome) => return (attempt, Ok(outcome)),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt, e.retry_after());
                warn!(
                    "{label} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                    retry.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (attempt, Err(e)),
        }
    }
}

fn describe_halt(halt: &Halt, steps: &[PlanStep]) -> String {
    match halt {
        Halt::Step { index, error, .. } => format!("{}: {error}", steps[*index]),
        Halt::Unresolved {
            index, reference, ..
        } => format!("{}: unresolved {reference}", steps[*index]),
        Halt::Store(e) => e.to_string(),
        Halt::Aborted(message) => message.clone(),
    }
}

/// Resolves every reference in the properties of `resource`.
fn resolve_properties(
    resource: &Resource,
    state: &StateDocument,
) -> std::result::Result<BTreeMap<String, Value>, (String, Reference)> {
    let lookup = |r: &Reference| state.resolve_reference(r);
    resource
        .properties
        .iter()
        .map(|(field, value)| {
            value
                .resolve(&lookup)
                .map(|v| (field.clone(), v))
                .map_err(|r| (field.clone(), r))
        })
        .collect()
}

impl<'a> PlanExecutor<'a> {
    /// Creates an executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: &'a dyn StateStore) -> Self {
        Self {
            provider,
            store,
            settings: ExecutorSettings::default(),
            cancel: CancellationFlag::new(),
            operation: RunOperation::Apply,
        }
    }

    /// Sets the concurrency and retry settings.
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

    /// Sets the operation recorded in the run history.
    #[must_use]
    pub const fn for_operation(mut self, operation: RunOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Returns the cancellation flag.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Executes a plan against `state`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] if the plan was computed against
    /// another state version, or an [`ExecutionError`] carrying the
    /// persisted partial state if the run stopped early.
    pub async fn apply(&self, plan: Plan, mut state: StateDocument) -> Result<ApplyReport> {
        if plan.base_version != state.version {
            return Err(StateError::Conflict {
                expected: plan.base_version,
                found: state.version,
            }
            .into());
        }

        let started = Instant::now();
        let Plan {
            config_hash, steps, ..
        } = plan;
        let total = steps.len();
        info!(
            "Applying plan with {total} steps using {} ({} concurrent)",
            self.provider.kind(),
            self.settings.concurrency
        );

        let mut status = vec![StepStatus::Pending; total];
        let mut tasks: JoinSet<StepResult> = JoinSet::new();
        let mut halt: Option<Halt> = None;
        let mut report = ApplyReport {
            succeeded: 0,
            created: 0,
            updated: 0,
            deleted: 0,
            state: StateDocument::new(&state.stack),
            duration: Duration::ZERO,
        };
        let mut touched: Vec<String> = Vec::new();

        loop {
            if halt.is_none() && !self.cancel.is_cancelled() {
                self.launch_ready(&steps, &mut status, &state, &mut tasks, &mut halt);
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let (index, attempts, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Step task failed: {e}");
                    if halt.is_none() {
                        halt = Some(Halt::Aborted(e.to_string()));
                    }
                    continue;
                }
            };

            let step = &steps[index];
            match result {
                Ok(outcome) => {
                    status[index] = StepStatus::Succeeded;
                    info!("{step} succeeded");
                    Self::record(step, outcome, &mut state);
                    report.succeeded += 1;
                    match step.action() {
                        StepAction::Create => report.created += 1,
                        StepAction::Update => report.updated += 1,
                        StepAction::Delete => report.deleted += 1,
                    }
                    let name = step.resource.to_string();
                    if !touched.contains(&name) {
                        touched.push(name);
                    }

                    if let Err(e) = self.store.save(&mut state).await {
                        error!("Failed to checkpoint state after {step}: {e}");
                        if halt.is_none() {
                            halt = Some(Halt::Store(e));
                        }
                    }
                }
                Err(e) => {
                    status[index] = StepStatus::Failed;
                    error!("{step} failed after {attempts} attempt(s): {e}");
                    if halt.is_none() {
                        halt = Some(Halt::Step {
                            index,
                            attempts,
                            error: e,
                        });
                    }
                }
            }
        }

        let not_started = status
            .iter()
            .filter(|s| **s == StepStatus::Pending)
            .count();
        let cancelled = halt.is_none() && not_started > 0 && self.cancel.is_cancelled();

        if let Some(Halt::Store(e)) = halt {
            return Err(e);
        }

        let entry = match (&halt, cancelled) {
            (None, false) => {
                state.config_hash.clone_from(&config_hash);
                RunHistoryEntry::new(self.operation, &config_hash, touched)
            }
            (None, true) => RunHistoryEntry::failed(
                self.operation,
                &config_hash,
                touched,
                "cancelled",
            ),
            (Some(h), _) => RunHistoryEntry::failed(
                self.operation,
                &config_hash,
                touched,
                &describe_halt(h, &steps),
            ),
        };
        state.add_history(entry);
        self.store.save(&mut state).await?;

        let succeeded = report.succeeded;
        match halt {
            None if cancelled => {
                warn!("Apply cancelled with {not_started} step(s) not started");
                Err(ExecutionError::Cancelled {
                    succeeded,
                    not_started,
                    partial: Box::new(state),
                }
                .into())
            }
            None => {
                report.duration = started.elapsed();
                info!(
                    "Apply finished: {} created, {} updated, {} deleted in {:?}",
                    report.created, report.updated, report.deleted, report.duration
                );
                report.state = state;
                Ok(report)
            }
            Some(Halt::Step {
                index,
                attempts,
                error,
            }) => Err(ExecutionError::StepFailed {
                resource: steps[index].resource.clone(),
                action: steps[index].action(),
                attempts,
                source: error,
                succeeded,
                partial: Box::new(state),
            }
            .into()),
            Some(Halt::Unresolved {
                index,
                field,
                reference,
            }) => Err(ExecutionError::UnresolvedOutput {
                resource: steps[index].resource.clone(),
                action: steps[index].action(),
                field,
                target: reference.target,
                attr: reference.attr,
                succeeded,
                partial: Box::new(state),
            }
            .into()),
            Some(Halt::Aborted(message)) => Err(ExecutionError::Aborted {
                message,
                succeeded,
                partial: Box::new(state),
            }
            .into()),
            Some(Halt::Store(e)) => Err(e),
        }
    }

    /// Starts every ready step, up to the concurrency limit.
    fn launch_ready(
        &self,
        steps: &[PlanStep],
        status: &mut [StepStatus],
        state: &StateDocument,
        tasks: &mut JoinSet<StepResult>,
        halt: &mut Option<Halt>,
    ) {
        for (index, step) in steps.iter().enumerate() {
            if tasks.len() >= self.settings.concurrency {
                break;
            }
            if status[index] != StepStatus::Pending
                || !step
                    .depends_on
                    .iter()
                    .all(|d| status[*d] == StepStatus::Succeeded)
            {
                continue;
            }

            let call = match Self::prepare(step, state) {
                Ok(call) => call,
                Err((field, reference)) => {
                    error!("{step} cannot resolve {field}: {reference} is not available");
                    status[index] = StepStatus::Failed;
                    *halt = Some(Halt::Unresolved {
                        index,
                        field,
                        reference,
                    });
                    return;
                }
            };

            debug!("Starting step {index}: {step}");
            status[index] = StepStatus::InProgress;
            let provider = Arc::clone(&self.provider);
            let retry = self.settings.retry;
            let label = step.to_string();
            tasks.spawn(async move {
                let (attempts, result) =
                    run_with_retry(provider.as_ref(), &call, retry, &label).await;
                (index, attempts, result)
            });
        }
    }

    /// Builds the provider call for a step against the current state.
    fn prepare(
        step: &PlanStep,
        state: &StateDocument,
    ) -> std::result::Result<Call, (String, Reference)> {
        Ok(match &step.kind {
            StepKind::Create { resource, .. } => Call::Create(ResourceSpec::new(
                resource.id.clone(),
                resolve_properties(resource, state)?,
            )),
            StepKind::Update {
                resource, changes, ..
            } if changes.is_empty() => Call::Keep(
                state
                    .get(&resource.id)
                    .map(|record| record.outputs.clone())
                    .unwrap_or_default(),
            ),
            StepKind::Update {
                resource,
                provider_id,
                changes,
            } => Call::Update {
                provider_id: provider_id.clone(),
                changes: ResourceChanges {
                    id: resource.id.clone(),
                    changed: changes.iter().map(|c| c.field.clone()).collect(),
                    properties: resolve_properties(resource, state)?,
                },
            },
            StepKind::Delete { provider_id, .. } => Call::Delete {
                resource_type: step.resource.resource_type.clone(),
                provider_id: provider_id.clone(),
            },
        })
    }

    /// Applies the effect of a successful step to the state.
    fn record(step: &PlanStep, outcome: Outcome, state: &mut StateDocument) {
        match (&step.kind, outcome) {
            (StepKind::Create { resource, deposes }, Outcome::Created(created)) => {
                if let Some(old) = deposes {
                    state.add_deposed(resource.id.clone(), old.clone());
                }
                state.set_record(StateRecord::new(
                    resource.id.clone(),
                    created.provider_id,
                    resource.properties.clone(),
                    created.outputs,
                    resource.dependencies(),
                ));
            }
            (StepKind::Update { resource, .. }, Outcome::Updated(outputs)) => {
                if let Some(record) = state.records.get_mut(&resource.id) {
                    record.properties.clone_from(&resource.properties);
                    record.outputs = outputs;
                    record.dependencies = resource.dependencies();
                    record.updated_at = Utc::now();
                }
            }
            (
                StepKind::Delete {
                    provider_id,
                    deposed,
                },
                Outcome::Deleted,
            ) => {
                if *deposed {
                    state.remove_deposed(&step.resource, provider_id);
                } else if state
                    .get(&step.resource)
                    .is_some_and(|r| r.provider_id == *provider_id)
                {
                    state.remove_record(&step.resource);
                }
            }
            (kind, outcome) => {
                warn!("Ignoring {outcome:?} for {} step", kind.action());
            }
        }
    }

    /// Re-reads every recorded object and updates outputs.
    ///
    /// Records whose object no longer exists are dropped, as are deposed
    /// objects that are already gone.
    ///
    /// # Errors
    ///
    /// Returns the first provider error (after retries) or a store error.
    /// Nothing is saved in that case.
    pub async fn refresh(&self, mut state: StateDocument) -> Result<RefreshReport> {
        info!("Refreshing {} record(s)", state.records.len());
        let retry = self.settings.retry;
        let mut updated = Vec::new();
        let mut removed = Vec::new();

        let records: Vec<(ResourceId, String)> = state
            .records
            .values()
            .map(|r| (r.id.clone(), r.provider_id.clone()))
            .collect();

        for (id, provider_id) in records {
            let call = Call::Read {
                resource_type: id.resource_type.clone(),
                provider_id: provider_id.clone(),
            };
            let (_, result) =
                run_with_retry(self.provider.as_ref(), &call, retry, &format!("read {id}")).await;

            match result? {
                Outcome::Read(Some(outputs)) => {
                    if let Some(record) = state.records.get_mut(&id)
                        && record.outputs != outputs
                    {
                        debug!("Outputs of {id} changed");
                        record.outputs = outputs;
                        record.updated_at = Utc::now();
                        updated.push(id);
                    }
                }
                Outcome::Read(None) => {
                    warn!("{id} ({provider_id}) no longer exists; dropping it from state");
                    state.remove_record(&id);
                    removed.push(id);
                }
                other => warn!("Ignoring {other:?} for read of {id}"),
            }
        }

        for object in state.deposed.clone() {
            let call = Call::Read {
                resource_type: object.id.resource_type.clone(),
                provider_id: object.provider_id.clone(),
            };
            let label = format!("read deposed {}", object.id);
            let (_, result) = run_with_retry(self.provider.as_ref(), &call, retry, &label).await;
            if let Outcome::Read(None) = result? {
                debug!("Deposed {} ({}) is already gone", object.id, object.provider_id);
                state.remove_deposed(&object.id, &object.provider_id);
            }
        }

        let touched = updated
            .iter()
            .chain(removed.iter())
            .map(ToString::to_string)
            .collect();
        let hash = state.config_hash.clone();
        state.add_history(RunHistoryEntry::new(RunOperation::Refresh, &hash, touched));
        self.store.save(&mut state).await?;

        Ok(RefreshReport {
            updated,
            removed,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Graph, Lifecycle, ReplaceStrategy};
    use crate::planner::{DiffEngine, Planner};
    use crate::provider::{CallKind, MemoryProvider, MockProvider};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("vm", name)
    }

    fn fast() -> ExecutorSettings {
        ExecutorSettings {
            concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        }
    }

    fn plan_for(graph: &Graph, state: &StateDocument) -> Plan {
        let ops = DiffEngine::new().diff(graph, state).expect("diff");
        Planner::new(ReplaceStrategy::DestroyBeforeCreate)
            .based_on(state.version, "hash")
            .plan(ops, graph)
            .expect("plan")
    }

    fn setup() -> (TempDir, LocalStateStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalStateStore::new(dir.path(), "demo-dev");
        (dir, store)
    }

    fn independent(names: &[&str]) -> Graph {
        Graph::new(names.iter().map(|n| Resource::new(id(n))).collect())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3, None), Duration::from_millis(350));
        assert_eq!(retry.delay_for(40, None), Duration::from_millis(350));
        assert_eq!(
            retry.delay_for(1, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_partial_failure_is_persisted_and_resumable() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_permanent(&id("b"), CallKind::Create);

        let graph = independent(&["a", "b", "c"]);
        let state = store.load().await.expect("load");
        let executor = PlanExecutor::new(provider.clone(), &store).with_settings(fast());

        let err = executor
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("b fails");
        match &err {
            ConvergeError::Execution(ExecutionError::StepFailed {
                resource,
                attempts,
                succeeded,
                ..
            }) => {
                assert_eq!(resource, &id("b"));
                assert_eq!(*attempts, 1);
                assert_eq!(*succeeded, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), crate::error::EXIT_PARTIAL_APPLY);

        let stored = store.load().await.expect("load");
        assert_eq!(stored.records.len(), 2);
        assert!(stored.get(&id("a")).is_some());
        assert!(stored.get(&id("c")).is_some());
        assert!(!stored.history.last().expect("history").success);

        provider.clear_faults();
        let plan = plan_for(&graph, &stored);
        assert_eq!(plan.step_count(), 1);
        let report = executor.apply(plan, stored).await.expect("rerun");
        assert_eq!(report.created, 1);
        assert_eq!(report.state.records.len(), 3);
        assert_eq!(provider.object_count(), 3);
        assert!(plan_for(&graph, &report.state).is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_transient(&id("a"), CallKind::Create, 2);

        let graph = independent(&["a"]);
        let state = store.load().await.expect("load");
        let report = PlanExecutor::new(provider.clone(), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect("apply");

        assert_eq!(report.created, 1);
        assert_eq!(provider.call_count(CallKind::Create), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_transient(&id("a"), CallKind::Create, 10);

        let graph = independent(&["a"]);
        let state = store.load().await.expect("load");
        let err = PlanExecutor::new(provider.clone(), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("exhausted");

        assert!(matches!(
            err,
            ConvergeError::Execution(ExecutionError::StepFailed { attempts: 3, succeeded: 0, .. })
        ));
        assert_eq!(err.exit_code(), crate::error::EXIT_PROVIDER);
        assert_eq!(provider.call_count(CallKind::Create), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (_dir, store) = setup();
        let mut mock = MockProvider::new();
        mock.expect_create_resource()
            .times(1)
            .returning(|_| Err(ProviderError::permanent("invalid image")));
        mock.expect_kind().return_const("mock");

        let graph = independent(&["a"]);
        let state = store.load().await.expect("load");
        let err = PlanExecutor::new(Arc::new(mock), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("permanent");

        match err {
            ConvergeError::Execution(ExecutionError::StepFailed {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(source, ProviderError::permanent("invalid image"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Delegates to a memory provider but panics when creating `vm.b`.
    struct PanicsOnB(MemoryProvider);

    #[async_trait::async_trait]
    impl Provider for PanicsOnB {
        async fn create_resource(&self, spec: &ResourceSpec) -> ProviderResult<Created> {
            assert_ne!(spec.id, id("b"), "provider bug");
            self.0.create_resource(spec).await
        }

        async fn update_resource(
            &self,
            provider_id: &str,
            changes: &ResourceChanges,
        ) -> ProviderResult<Outputs> {
            self.0.update_resource(provider_id, changes).await
        }

        async fn delete_resource(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
            self.0.delete_resource(resource_type, provider_id).await
        }

        async fn read_resource(
            &self,
            resource_type: &str,
            provider_id: &str,
        ) -> ProviderResult<Option<Outputs>> {
            self.0.read_resource(resource_type, provider_id).await
        }

        fn kind(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_step_keeps_partial_state() {
        let (_dir, store) = setup();
        let graph = independent(&["a", "b", "c"]);
        let state = store.load().await.expect("load");
        let err = PlanExecutor::new(Arc::new(PanicsOnB(MemoryProvider::new())), &store)
            .with_settings(ExecutorSettings {
                concurrency: 1,
                ..fast()
            })
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("b aborts");

        match &err {
            ConvergeError::Execution(ExecutionError::Aborted {
                succeeded, partial, ..
            }) => {
                assert_eq!(*succeeded, 1);
                assert!(partial.get(&id("a")).is_some());
                assert!(partial.get(&id("c")).is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), crate::error::EXIT_PARTIAL_APPLY);

        let stored = store.load().await.expect("load");
        assert_eq!(stored.records.len(), 1);
        assert!(!stored.history.last().expect("history").success);
    }

    #[tokio::test]
    async fn test_dependency_only_update_skips_provider() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        let executor = PlanExecutor::new(provider.clone(), &store).with_settings(fast());

        let graph = independent(&["a", "z"]);
        let state = store.load().await.expect("load");
        let report = executor
            .apply(plan_for(&graph, &state), state)
            .await
            .expect("apply");

        let rewired = Graph::new(vec![
            Resource::new(id("a")).with_dependency(id("z")),
            Resource::new(id("z")),
        ]);
        let plan = plan_for(&rewired, &report.state);
        assert_eq!(plan.update_count(), 1);

        let report = executor.apply(plan, report.state).await.expect("rewire");
        assert_eq!(provider.call_count(CallKind::Update), 0);
        assert!(
            report
                .state
                .get(&id("a"))
                .expect("a recorded")
                .dependencies
                .contains(&id("z"))
        );
        assert!(plan_for(&rewired, &report.state).is_empty());

        let destroy = plan_for(&Graph::empty(), &report.state);
        let delete_a = destroy.find(&id("a"), StepAction::Delete).expect("delete a");
        let delete_z = destroy.find(&id("z"), StepAction::Delete).expect("delete z");
        assert!(delete_z.depends_on.contains(&delete_a.index));
    }

    #[tokio::test]
    async fn test_dependents_receive_resolved_outputs() {
        let (_dir, store) = setup();
        let mut outputs = Outputs::new();
        outputs.insert(String::from("address"), Value::from("10.0.0.5"));
        let provider = Arc::new(MemoryProvider::new().with_outputs("vm", outputs));

        let graph = Graph::new(vec![
            Resource::new(id("b"))
                .with_property("upstream", Reference::output(id("a"), "address"))
                .with_property("parent", Reference::id_of(id("a"))),
            Resource::new(id("a")),
        ]);
        let state = store.load().await.expect("load");
        let report = PlanExecutor::new(provider.clone(), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect("apply");

        let creates: Vec<ResourceId> = provider
            .calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Create)
            .map(|c| c.resource)
            .collect();
        assert_eq!(creates, vec![id("a"), id("b")]);

        let a_id = report.state.get(&id("a")).expect("a").provider_id.clone();
        let b_id = report.state.get(&id("b")).expect("b").provider_id.clone();
        let props = provider.properties_of(&b_id).expect("b object");
        assert_eq!(props["upstream"], Value::from("10.0.0.5"));
        assert_eq!(props["parent"], Value::String(a_id));

        // State keeps the declared references, not the resolved values.
        assert!(matches!(
            report.state.get(&id("b")).expect("b").properties["parent"],
            Value::Ref(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_permanent(&id("a"), CallKind::Create);

        let graph = Graph::new(vec![
            Resource::new(id("a")),
            Resource::new(id("b")).with_dependency(id("a")),
        ]);
        let state = store.load().await.expect("load");
        let err = PlanExecutor::new(provider.clone(), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("a fails");

        assert_eq!(err.exit_code(), crate::error::EXIT_PROVIDER);
        assert!(provider.calls().iter().all(|c| c.resource != id("b")));
    }

    #[tokio::test]
    async fn test_unresolved_output_halts() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());

        let graph = Graph::new(vec![
            Resource::new(id("a")),
            Resource::new(id("b")).with_property("ip", Reference::output(id("a"), "public_ip")),
        ]);
        let state = store.load().await.expect("load");
        let err = PlanExecutor::new(provider.clone(), &store)
            .with_settings(fast())
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("missing output");

        match err {
            ConvergeError::Execution(ExecutionError::UnresolvedOutput {
                resource,
                attr,
                partial,
                ..
            }) => {
                assert_eq!(resource, id("b"));
                assert_eq!(attr, "public_ip");
                assert!(partial.get(&id("a")).is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(20)));

        let graph = independent(&["a", "b", "c", "d", "e", "f"]);
        let state = store.load().await.expect("load");
        let settings = ExecutorSettings {
            concurrency: 2,
            ..fast()
        };
        let report = PlanExecutor::new(provider.clone(), &store)
            .with_settings(settings)
            .apply(plan_for(&graph, &state), state)
            .await
            .expect("apply");

        assert_eq!(report.created, 6);
        assert!(provider.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_steps_finish() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(100)));

        let graph = independent(&["a", "b", "c"]);
        let state = store.load().await.expect("load");
        let flag = CancellationFlag::new();
        let executor = PlanExecutor::new(provider.clone(), &store)
            .with_settings(ExecutorSettings {
                concurrency: 1,
                ..fast()
            })
            .with_cancellation(flag.clone());

        let trigger = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor
            .apply(plan_for(&graph, &state), state)
            .await
            .expect_err("cancelled");
        assert!(matches!(
            err,
            ConvergeError::Execution(ExecutionError::Cancelled { succeeded: 1, not_started: 2, .. })
        ));

        let stored = store.load().await.expect("load");
        assert_eq!(stored.records.len(), 1);
        assert_eq!(provider.object_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        let graph = independent(&["a"]);

        let mut state = store.load().await.expect("load");
        let plan = plan_for(&graph, &state);
        store.save(&mut state).await.expect("save");

        let err = PlanExecutor::new(provider.clone(), &store)
            .apply(plan, state)
            .await
            .expect_err("stale");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::Conflict { expected: 0, found: 1 })
        ));
        assert_eq!(provider.call_count(CallKind::Create), 0);
    }

    #[tokio::test]
    async fn test_create_before_destroy_replacement() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        let executor = PlanExecutor::new(provider.clone(), &store).with_settings(fast());

        let lifecycle = Lifecycle {
            replace_on: std::collections::BTreeSet::from([String::from("image")]),
            replace_strategy: Some(ReplaceStrategy::CreateBeforeDestroy),
            ..Lifecycle::default()
        };
        let graph_with = |image: &str| {
            Graph::new(vec![
                Resource::new(id("a"))
                    .with_property("image", image)
                    .with_lifecycle(lifecycle.clone()),
                Resource::new(id("b")).with_property("parent", Reference::id_of(id("a"))),
            ])
        };

        let state = store.load().await.expect("load");
        let first = graph_with("v1");
        let state = executor
            .apply(plan_for(&first, &state), state)
            .await
            .expect("first apply")
            .state;
        let old_a = state.get(&id("a")).expect("a").provider_id.clone();

        let second = graph_with("v2");
        let report = executor
            .apply(plan_for(&second, &state), state)
            .await
            .expect("replace");

        let new_a = report.state.get(&id("a")).expect("a").provider_id.clone();
        assert_ne!(new_a, old_a);
        assert!(report.state.deposed.is_empty());
        assert_eq!(provider.objects_of(&id("a")), vec![new_a.clone()]);

        let b_id = report.state.get(&id("b")).expect("b").provider_id.clone();
        let b_props = provider.properties_of(&b_id).expect("b object");
        assert_eq!(b_props["parent"], Value::String(new_a));

        let kinds: Vec<CallKind> = provider
            .calls()
            .into_iter()
            .skip(2)
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![CallKind::Create, CallKind::Update, CallKind::Delete]);
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_objects() {
        let (_dir, store) = setup();
        let provider = Arc::new(MemoryProvider::new());
        let executor = PlanExecutor::new(provider.clone(), &store).with_settings(fast());

        let graph = independent(&["a", "b"]);
        let state = store.load().await.expect("load");
        let state = executor
            .apply(plan_for(&graph, &state), state)
            .await
            .expect("apply")
            .state;

        let gone = state.get(&id("a")).expect("a").provider_id.clone();
        assert!(provider.forget(&gone));

        let report = executor.refresh(state).await.expect("refresh");
        assert_eq!(report.removed, vec![id("a")]);
        assert!(report.state.get(&id("a")).is_none());
        assert_eq!(
            report.state.history.last().map(|h| h.operation),
            Some(RunOperation::Refresh)
        );

        let plan = plan_for(&graph, &report.state);
        assert_eq!(plan.create_count(), 1);
    }
}
