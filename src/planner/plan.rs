//! Execution plan types and construction.
//!
//! This module turns an edit script into an ordered plan. Every edit
//! becomes one or two steps: an "up" step (create or update) and a "down"
//! step (delete). Replacements get both, ordered according to their
//! replace strategy.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::PlanError;
use crate::model::{Graph, ReplaceStrategy, Resource, ResourceId};

use super::diff::{EditOp, FieldChange};

/// A complete execution plan.
///
/// Plans are consumed by value when executed.
#[derive(Debug)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// State version the plan was computed against.
    pub base_version: u64,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

/// A single planned step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    /// Position in the plan.
    pub index: usize,
    /// Resource the step acts on.
    pub resource: ResourceId,
    /// What the step does.
    pub kind: StepKind,
    /// Whether the step is half of a replacement.
    pub replacement: bool,
    /// Reason for this step.
    pub reason: String,
    /// Steps that must succeed first (indices into the plan).
    pub depends_on: Vec<usize>,
    /// Wave number; steps in the same wave are independent.
    pub wave: usize,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Create a new object.
    Create {
        /// Desired resource.
        resource: Resource,
        /// Object this one replaces, kept until a later delete step.
        deposes: Option<String>,
    },
    /// Update an existing object in place.
    Update {
        /// Desired resource.
        resource: Resource,
        /// Identity of the existing object.
        provider_id: String,
        /// Changed fields.
        changes: Vec<FieldChange>,
    },
    /// Delete an object.
    Delete {
        /// Identity of the object.
        provider_id: String,
        /// Whether the object is deposed rather than the current one.
        deposed: bool,
    },
}

/// Phase of a step, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepAction {
    /// Create phase.
    Create,
    /// Update phase.
    Update,
    /// Delete phase.
    Delete,
}

/// Builds plans from edit scripts.
#[derive(Debug, Clone)]
pub struct Planner {
    default_strategy: ReplaceStrategy,
    base_version: u64,
    config_hash: String,
}

/// A step before it has a position in the plan.
#[derive(Debug)]
struct Node {
    resource: ResourceId,
    kind: StepKind,
    replacement: bool,
    reason: String,
}

/// Nodes and ordering edges under construction.
#[derive(Debug, Default)]
struct NodeGraph {
    nodes: Vec<Node>,
    preds: Vec<BTreeSet<usize>>,
    up: HashMap<ResourceId, usize>,
    down: HashMap<ResourceId, usize>,
    deposed: Vec<(ResourceId, usize)>,
}

impl NodeGraph {
    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.preds.push(BTreeSet::new());
        self.nodes.len() - 1
    }

    fn add_up(&mut self, node: Node) -> usize {
        let id = node.resource.clone();
        let index = self.push(node);
        self.up.insert(id, index);
        index
    }

    fn add_down(&mut self, node: Node) -> usize {
        let id = node.resource.clone();
        let index = self.push(node);
        self.down.insert(id, index);
        index
    }

    /// Orders `before` ahead of `after`.
    fn edge(&mut self, before: usize, after: usize) {
        if before != after {
            self.preds[after].insert(before);
        }
    }

    fn up_of(&self, id: &ResourceId) -> Option<usize> {
        self.up.get(id).copied()
    }

    fn down_of(&self, id: &ResourceId) -> Option<usize> {
        self.down.get(id).copied()
    }
}

impl Planner {
    /// Creates a planner with the stack-wide replace strategy.
    #[must_use]
    pub const fn new(default_strategy: ReplaceStrategy) -> Self {
        Self {
            default_strategy,
            base_version: 0,
            config_hash: String::new(),
        }
    }

    /// Records the state version and configuration hash the plan is based on.
    #[must_use]
    pub fn based_on(mut self, version: u64, config_hash: impl Into<String>) -> Self {
        self.base_version = version;
        self.config_hash = config_hash.into();
        self
    }

    /// Orders an edit script into a plan.
    ///
    /// Creates and updates run after the creates and updates of their
    /// dependencies. Deletes run after the deletes of everything that
    /// depended on them. A replacement is split into its delete and create
    /// halves according to its replace strategy.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Unplannable`] if the steps cannot be ordered.
    pub fn plan(&self, ops: Vec<EditOp>, graph: &Graph) -> Result<Plan, PlanError> {
        let strategies = self.replace_strategies(&ops, graph);

        let mut nodes = NodeGraph::default();
        let mut old_deps: HashMap<ResourceId, BTreeSet<ResourceId>> = HashMap::new();
        let mut cbd_replaced: BTreeSet<ResourceId> = BTreeSet::new();

        for op in ops {
            match op {
                EditOp::Create { resource } => {
                    nodes.add_up(Node {
                        resource: resource.id.clone(),
                        kind: StepKind::Create {
                            resource,
                            deposes: None,
                        },
                        replacement: false,
                        reason: String::from("declared but not yet created"),
                    });
                }
                EditOp::Update {
                    resource,
                    provider_id,
                    changes,
                    previous_dependencies,
                } => {
                    let id = resource.id.clone();
                    nodes.add_up(Node {
                        resource: id.clone(),
                        reason: if changes.is_empty() {
                            String::from("dependencies changed (state only)")
                        } else {
                            format!("changed: {}", field_list(&changes, false))
                        },
                        kind: StepKind::Update {
                            resource,
                            provider_id,
                            changes,
                        },
                        replacement: false,
                    });
                    old_deps.insert(id, previous_dependencies);
                }
                EditOp::Replace {
                    resource,
                    old_provider_id,
                    changes,
                    previous_dependencies,
                } => {
                    let id = resource.id.clone();
                    let strategy = strategies
                        .get(&id)
                        .copied()
                        .unwrap_or(self.default_strategy);
                    let triggers = field_list(&changes, true);

                    match strategy {
                        ReplaceStrategy::DestroyBeforeCreate => {
                            let down = nodes.add_down(Node {
                                resource: id.clone(),
                                kind: StepKind::Delete {
                                    provider_id: old_provider_id,
                                    deposed: false,
                                },
                                replacement: true,
                                reason: format!("replacing (destroy first): {triggers}"),
                            });
                            let up = nodes.add_up(Node {
                                resource: id.clone(),
                                kind: StepKind::Create {
                                    resource,
                                    deposes: None,
                                },
                                replacement: true,
                                reason: format!("replacing (destroy first): {triggers}"),
                            });
                            nodes.edge(down, up);
                        }
                        ReplaceStrategy::CreateBeforeDestroy => {
                            let up = nodes.add_up(Node {
                                resource: id.clone(),
                                kind: StepKind::Create {
                                    resource,
                                    deposes: Some(old_provider_id.clone()),
                                },
                                replacement: true,
                                reason: format!("replacing (create first): {triggers}"),
                            });
                            let down = nodes.add_down(Node {
                                resource: id.clone(),
                                kind: StepKind::Delete {
                                    provider_id: old_provider_id,
                                    deposed: true,
                                },
                                replacement: true,
                                reason: format!("replacing (create first): {triggers}"),
                            });
                            nodes.edge(up, down);
                            cbd_replaced.insert(id.clone());
                        }
                    }
                    old_deps.insert(id, previous_dependencies);
                }
                EditOp::Delete {
                    id,
                    provider_id,
                    previous_dependencies,
                    deposed: false,
                } => {
                    nodes.add_down(Node {
                        resource: id.clone(),
                        kind: StepKind::Delete {
                            provider_id,
                            deposed: false,
                        },
                        replacement: false,
                        reason: String::from("removed from configuration"),
                    });
                    old_deps.insert(id, previous_dependencies);
                }
                EditOp::Delete {
                    id,
                    provider_id,
                    deposed: true,
                    ..
                } => {
                    let index = nodes.push(Node {
                        resource: id.clone(),
                        kind: StepKind::Delete {
                            provider_id,
                            deposed: true,
                        },
                        replacement: false,
                        reason: String::from("left behind by an earlier replacement"),
                    });
                    nodes.deposed.push((id, index));
                }
            }
        }

        Self::add_edges(&mut nodes, graph, &old_deps, &cbd_replaced);
        self.order(nodes)
    }

    /// Resolves the replace strategy of every replacement.
    ///
    /// A create-before-destroy replacement that depends on a
    /// destroy-before-create replacement cannot keep its old object alive
    /// past the dependency's delete, so it is downgraded. Downgrades
    /// propagate until nothing changes.
    fn replace_strategies(
        &self,
        ops: &[EditOp],
        graph: &Graph,
    ) -> HashMap<ResourceId, ReplaceStrategy> {
        let mut strategies = HashMap::new();
        let mut deps: HashMap<ResourceId, BTreeSet<ResourceId>> = HashMap::new();

        for op in ops {
            if let EditOp::Replace {
                resource,
                previous_dependencies,
                ..
            } = op
            {
                strategies.insert(
                    resource.id.clone(),
                    resource
                        .lifecycle
                        .replace_strategy
                        .unwrap_or(self.default_strategy),
                );
                let mut all = graph.dependencies(&resource.id);
                all.extend(previous_dependencies.iter().cloned());
                deps.insert(resource.id.clone(), all);
            }
        }

        loop {
            let downgrade: Vec<ResourceId> = strategies
                .iter()
                .filter(|(_, s)| **s == ReplaceStrategy::CreateBeforeDestroy)
                .filter(|(id, _)| {
                    deps.get(*id).is_some_and(|ds| {
                        ds.iter().any(|d| {
                            strategies.get(d) == Some(&ReplaceStrategy::DestroyBeforeCreate)
                        })
                    })
                })
                .map(|(id, _)| id.clone())
                .collect();

            if downgrade.is_empty() {
                break;
            }
            for id in downgrade {
                debug!("{id} depends on a destroy-first replacement; replacing it destroy-first");
                strategies.insert(id, ReplaceStrategy::DestroyBeforeCreate);
            }
        }

        strategies
    }

    fn add_edges(
        nodes: &mut NodeGraph,
        graph: &Graph,
        old_deps: &HashMap<ResourceId, BTreeSet<ResourceId>>,
        cbd_replaced: &BTreeSet<ResourceId>,
    ) {
        let empty = BTreeSet::new();
        let ups: Vec<(ResourceId, usize)> =
            nodes.up.iter().map(|(id, i)| (id.clone(), *i)).collect();
        let downs: Vec<(ResourceId, usize)> =
            nodes.down.iter().map(|(id, i)| (id.clone(), *i)).collect();
        let deposed = nodes.deposed.clone();

        for (x, up_x) in &ups {
            let new = graph.dependencies(x);
            let old = old_deps.get(x).unwrap_or(&empty);

            // Dependencies are created or updated first.
            for d in &new {
                if let Some(up_d) = nodes.up_of(d) {
                    nodes.edge(up_d, *up_x);
                }
            }

            // A dependency is deleted only once nothing points at it anymore.
            for d in old.iter().chain(new.iter()) {
                let released = !new.contains(d) || cbd_replaced.contains(d);
                if released && let Some(down_d) = nodes.down_of(d) {
                    nodes.edge(*up_x, down_d);
                }
            }

            for (owner, index) in &deposed {
                if new.contains(owner) || old.contains(owner) {
                    nodes.edge(*up_x, *index);
                }
            }
        }

        // Dependents are deleted before their dependencies.
        for (x, down_x) in &downs {
            for d in old_deps.get(x).unwrap_or(&empty) {
                if let Some(down_d) = nodes.down_of(d) {
                    nodes.edge(*down_x, down_d);
                }
            }
        }
    }

    /// Sorts nodes into waves (Kahn's algorithm), breaking ties by resource.
    fn order(&self, nodes: NodeGraph) -> Result<Plan, PlanError> {
        let NodeGraph {
            nodes: pending,
            preds,
            ..
        } = nodes;

        let count = pending.len();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut indegree: Vec<usize> = vec![0; count];
        for (node, ps) in preds.iter().enumerate() {
            indegree[node] = ps.len();
            for p in ps {
                succs[*p].push(node);
            }
        }

        let key = |i: &usize| (pending[*i].resource.clone(), phase_rank(&pending[*i].kind));
        let mut ready: Vec<usize> = (0..count).filter(|i| indegree[*i] == 0).collect();
        let mut position: Vec<Option<usize>> = vec![None; count];
        let mut sequence: Vec<(usize, usize)> = Vec::with_capacity(count);
        let mut wave = 0;

        while !ready.is_empty() {
            ready.sort_by_key(key);
            let mut next = Vec::new();
            for node in ready {
                position[node] = Some(sequence.len());
                sequence.push((node, wave));
                for s in &succs[node] {
                    indegree[*s] -= 1;
                    if indegree[*s] == 0 {
                        next.push(*s);
                    }
                }
            }
            ready = next;
            wave += 1;
        }

        if sequence.len() < count {
            let mut steps: Vec<String> = (0..count)
                .filter(|i| position[*i].is_none())
                .map(|i| format!("{} {}", pending[i].kind.action(), pending[i].resource))
                .collect();
            steps.sort();
            return Err(PlanError::Unplannable { steps });
        }

        let mut slots: Vec<Option<Node>> = pending.into_iter().map(Some).collect();
        let steps = sequence
            .into_iter()
            .enumerate()
            .filter_map(|(index, (node, wave))| {
                let Node {
                    resource,
                    kind,
                    replacement,
                    reason,
                } = slots[node].take()?;
                let mut depends_on: Vec<usize> =
                    preds[node].iter().filter_map(|p| position[*p]).collect();
                depends_on.sort_unstable();
                Some(PlanStep {
                    index,
                    resource,
                    kind,
                    replacement,
                    reason,
                    depends_on,
                    wave,
                })
            })
            .collect();

        Ok(Plan {
            created_at: Utc::now(),
            config_hash: self.config_hash.clone(),
            base_version: self.base_version,
            steps,
        })
    }
}

const fn phase_rank(kind: &StepKind) -> u8 {
    match kind {
        StepKind::Delete { .. } => 0,
        StepKind::Update { .. } => 1,
        StepKind::Create { .. } => 2,
    }
}

fn field_list(changes: &[FieldChange], forcing_only: bool) -> String {
    changes
        .iter()
        .filter(|c| !forcing_only || c.forces_replacement)
        .map(|c| c.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Plan {
    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(base_version: u64, config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            base_version,
            steps: Vec::new(),
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the number of waves.
    #[must_use]
    pub fn wave_count(&self) -> usize {
        self.steps.iter().map(|s| s.wave + 1).max().unwrap_or(0)
    }

    /// Returns the number of resources created from scratch.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(|s| s.action() == StepAction::Create && !s.replacement)
    }

    /// Returns the number of in-place updates.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(|s| s.action() == StepAction::Update)
    }

    /// Returns the number of replaced resources.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.count(|s| s.action() == StepAction::Create && s.replacement)
    }

    /// Returns the number of objects deleted outright.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(|s| s.action() == StepAction::Delete && !s.replacement)
    }

    fn count(&self, pred: impl Fn(&PlanStep) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(s)).count()
    }

    /// Returns the step for a resource and phase.
    #[must_use]
    pub fn find(&self, resource: &ResourceId, action: StepAction) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| &s.resource == resource && s.action() == action)
    }
}

impl PlanStep {
    /// Returns the phase of the step.
    #[must_use]
    pub const fn action(&self) -> StepAction {
        self.kind.action()
    }
}

impl StepKind {
    /// Returns the phase of the step.
    #[must_use]
    pub const fn action(&self) -> StepAction {
        match self {
            Self::Create { .. } => StepAction::Create,
            Self::Update { .. } => StepAction::Update,
            Self::Delete { .. } => StepAction::Delete,
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action(), self.resource)?;
        if let StepKind::Delete {
            provider_id,
            deposed: true,
        } = &self.kind
        {
            write!(f, " [{provider_id}]")?;
        }
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan ({} steps in {} waves):",
            self.steps.len(),
            self.wave_count()
        )?;
        for step in &self.steps {
            writeln!(f, "  {}. {step}", step.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Lifecycle, Reference, Value};

    fn id(name: &str) -> ResourceId {
        ResourceId::new("vm", name)
    }

    fn forced(field: &str) -> Vec<FieldChange> {
        vec![FieldChange {
            field: field.to_string(),
            old: Some(Value::from("v1")),
            new: Some(Value::from("v2")),
            forces_replacement: true,
        }]
    }

    fn index_of(plan: &Plan, name: &str, action: StepAction) -> usize {
        plan.find(&id(name), action)
            .map(|s| s.index)
            .unwrap_or_else(|| panic!("no {action} step for {name}"))
    }

    fn planner() -> Planner {
        Planner::new(ReplaceStrategy::DestroyBeforeCreate)
    }

    #[test]
    fn test_creates_follow_dependencies() {
        let a = Resource::new(id("a"));
        let b = Resource::new(id("b")).with_property("parent", Reference::id_of(id("a")));
        let graph = Graph::new(vec![b.clone(), a.clone()]);
        let ops = vec![
            EditOp::Create { resource: b },
            EditOp::Create { resource: a },
        ];

        let plan = planner().plan(ops, &graph).expect("plan");
        let a_step = index_of(&plan, "a", StepAction::Create);
        let b_step = index_of(&plan, "b", StepAction::Create);
        assert!(a_step < b_step);
        assert_eq!(plan.steps[b_step].depends_on, vec![a_step]);
        assert_eq!(plan.wave_count(), 2);
    }

    #[test]
    fn test_deletes_follow_dependents() {
        let ops = vec![
            EditOp::Delete {
                id: id("a"),
                provider_id: String::from("p-a"),
                previous_dependencies: BTreeSet::new(),
                deposed: false,
            },
            EditOp::Delete {
                id: id("b"),
                provider_id: String::from("p-b"),
                previous_dependencies: BTreeSet::from([id("a")]),
                deposed: false,
            },
        ];

        let plan = planner().plan(ops, &Graph::empty()).expect("plan");
        assert!(index_of(&plan, "b", StepAction::Delete) < index_of(&plan, "a", StepAction::Delete));
        assert_eq!(plan.delete_count(), 2);
    }

    #[test]
    fn test_independent_steps_share_a_wave() {
        let resources: Vec<Resource> = ["a", "b", "c"].iter().map(|n| Resource::new(id(n))).collect();
        let graph = Graph::new(resources.clone());
        let ops = resources
            .into_iter()
            .map(|resource| EditOp::Create { resource })
            .collect();

        let plan = planner().plan(ops, &graph).expect("plan");
        assert_eq!(plan.wave_count(), 1);
        assert!(plan.steps.iter().all(|s| s.depends_on.is_empty()));
        let names: Vec<&str> = plan.steps.iter().map(|s| s.resource.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_destroy_first_replacement() {
        let a = Resource::new(id("a")).with_property("image", "v2");
        let b = Resource::new(id("b")).with_property("parent", Reference::id_of(id("a")));
        let graph = Graph::new(vec![a.clone(), b.clone()]);
        let ops = vec![
            EditOp::Replace {
                resource: a,
                old_provider_id: String::from("p-a"),
                changes: forced("image"),
                previous_dependencies: BTreeSet::new(),
            },
            EditOp::Update {
                resource: b,
                provider_id: String::from("p-b"),
                changes: Vec::new(),
                previous_dependencies: BTreeSet::from([id("a")]),
            },
        ];

        let plan = planner().plan(ops, &graph).expect("plan");
        let delete_a = index_of(&plan, "a", StepAction::Delete);
        let create_a = index_of(&plan, "a", StepAction::Create);
        let update_b = index_of(&plan, "b", StepAction::Update);
        assert!(delete_a < create_a);
        assert!(create_a < update_b);
        assert_eq!(plan.replace_count(), 1);
        assert_eq!(plan.delete_count(), 0);
        assert!(matches!(
            &plan.steps[create_a].kind,
            StepKind::Create { deposes: None, .. }
        ));
    }

    #[test]
    fn test_create_first_replacement() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.replace_strategy = Some(ReplaceStrategy::CreateBeforeDestroy);
        let a = Resource::new(id("a"))
            .with_property("image", "v2")
            .with_lifecycle(lifecycle);
        let b = Resource::new(id("b")).with_property("parent", Reference::id_of(id("a")));
        let graph = Graph::new(vec![a.clone(), b.clone()]);
        let ops = vec![
            EditOp::Replace {
                resource: a,
                old_provider_id: String::from("p-a"),
                changes: forced("image"),
                previous_dependencies: BTreeSet::new(),
            },
            EditOp::Update {
                resource: b,
                provider_id: String::from("p-b"),
                changes: Vec::new(),
                previous_dependencies: BTreeSet::from([id("a")]),
            },
        ];

        let plan = planner().plan(ops, &graph).expect("plan");
        let create_a = index_of(&plan, "a", StepAction::Create);
        let update_b = index_of(&plan, "b", StepAction::Update);
        let delete_a = index_of(&plan, "a", StepAction::Delete);
        assert!(create_a < update_b);
        assert!(update_b < delete_a);
        assert!(matches!(
            &plan.steps[create_a].kind,
            StepKind::Create { deposes: Some(old), .. } if old == "p-a"
        ));
        assert!(matches!(
            &plan.steps[delete_a].kind,
            StepKind::Delete { deposed: true, .. }
        ));
    }

    #[test]
    fn test_create_first_downgraded_behind_destroy_first_dependency() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.replace_strategy = Some(ReplaceStrategy::CreateBeforeDestroy);
        let a = Resource::new(id("a")).with_property("image", "v2");
        let b = Resource::new(id("b"))
            .with_property("parent", Reference::id_of(id("a")))
            .with_property("image", "v2")
            .with_lifecycle(lifecycle);
        let graph = Graph::new(vec![a.clone(), b.clone()]);
        let ops = vec![
            EditOp::Replace {
                resource: a,
                old_provider_id: String::from("p-a"),
                changes: forced("image"),
                previous_dependencies: BTreeSet::new(),
            },
            EditOp::Replace {
                resource: b,
                old_provider_id: String::from("p-b"),
                changes: forced("image"),
                previous_dependencies: BTreeSet::from([id("a")]),
            },
        ];

        let plan = planner().plan(ops, &graph).expect("plan");
        let delete_b = index_of(&plan, "b", StepAction::Delete);
        let delete_a = index_of(&plan, "a", StepAction::Delete);
        let create_a = index_of(&plan, "a", StepAction::Create);
        let create_b = index_of(&plan, "b", StepAction::Create);
        assert!(delete_b < delete_a);
        assert!(delete_a < create_a);
        assert!(create_a < create_b);
        assert!(matches!(
            &plan.steps[create_b].kind,
            StepKind::Create { deposes: None, .. }
        ));
    }

    #[test]
    fn test_dependency_dropped_then_deleted() {
        let b = Resource::new(id("b")).with_property("size", "large");
        let graph = Graph::new(vec![b.clone()]);
        let ops = vec![
            EditOp::Update {
                resource: b,
                provider_id: String::from("p-b"),
                changes: Vec::new(),
                previous_dependencies: BTreeSet::from([id("a")]),
            },
            EditOp::Delete {
                id: id("a"),
                provider_id: String::from("p-a"),
                previous_dependencies: BTreeSet::new(),
                deposed: false,
            },
        ];

        let plan = planner().plan(ops, &graph).expect("plan");
        assert!(index_of(&plan, "b", StepAction::Update) < index_of(&plan, "a", StepAction::Delete));
    }

    #[test]
    fn test_cyclic_graph_is_unplannable() {
        let a = Resource::new(id("a")).with_dependency(id("b"));
        let b = Resource::new(id("b")).with_dependency(id("a"));
        let graph = Graph::new(vec![a.clone(), b.clone()]);
        let ops = vec![
            EditOp::Create { resource: a },
            EditOp::Create { resource: b },
        ];

        let err = planner().plan(ops, &graph).expect_err("cycle");
        let PlanError::Unplannable { steps } = err;
        assert_eq!(steps, vec!["create vm.a", "create vm.b"]);
    }

    #[test]
    fn test_plan_display() {
        let graph = Graph::new(vec![Resource::new(id("a"))]);
        let plan = planner()
            .based_on(3, "abc")
            .plan(
                vec![EditOp::Create {
                    resource: Resource::new(id("a")),
                }],
                &graph,
            )
            .expect("plan");

        assert_eq!(plan.base_version, 3);
        let text = plan.to_string();
        assert!(text.contains("Plan (1 steps in 1 waves)"));
        assert!(text.contains("0. create vm.a (declared but not yet created)"));
        assert_eq!(Plan::empty(0, "").to_string(), "No changes required");
    }
}
