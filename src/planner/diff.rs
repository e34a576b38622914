//! Diff engine for comparing the desired graph against recorded state.
//!
//! The result is an edit script: one [`EditOp`] per resource that needs
//! work, desired resources first (dependencies before dependents), then
//! removed resources, then deposed objects.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{Graph, Resource, ResourceId, Value};
use crate::state::{StateDocument, StateRecord};

/// Engine for computing edit scripts.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Fields that force a replacement, per resource type.
    replace_triggers: BTreeMap<String, BTreeSet<String>>,
}

/// A single changed field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Property name.
    pub field: String,
    /// Last applied value.
    pub old: Option<Value>,
    /// Declared value.
    pub new: Option<Value>,
    /// Whether this change forces a replacement.
    pub forces_replacement: bool,
}

/// One edit needed to converge.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    /// Declared but not recorded.
    Create {
        /// Desired resource.
        resource: Resource,
    },
    /// Recorded with changed fields that can be updated in place.
    Update {
        /// Desired resource.
        resource: Resource,
        /// Identity of the existing object.
        provider_id: String,
        /// Changed fields.
        changes: Vec<FieldChange>,
        /// Dependencies recorded at the last apply.
        previous_dependencies: BTreeSet<ResourceId>,
    },
    /// Recorded with a change that forces a new object.
    Replace {
        /// Desired resource.
        resource: Resource,
        /// Identity of the object being replaced.
        old_provider_id: String,
        /// Changed fields (at least one forces the replacement).
        changes: Vec<FieldChange>,
        /// Dependencies recorded at the last apply.
        previous_dependencies: BTreeSet<ResourceId>,
    },
    /// Recorded but no longer declared, or a deposed object.
    Delete {
        /// Resource identity.
        id: ResourceId,
        /// Identity of the object to delete.
        provider_id: String,
        /// Dependencies recorded at the last apply.
        previous_dependencies: BTreeSet<ResourceId>,
        /// Whether the object is a deposed leftover.
        deposed: bool,
    },
}

impl DiffEngine {
    /// Creates a diff engine with no stack-level replacement triggers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            replace_triggers: BTreeMap::new(),
        }
    }

    /// Sets the stack-level replacement triggers.
    #[must_use]
    pub fn with_replace_triggers(mut self, triggers: BTreeMap<String, BTreeSet<String>>) -> Self {
        self.replace_triggers = triggers;
        self
    }

    /// Computes the edit script that converges `current` to `desired`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError::Cycle`] if the desired graph is cyclic.
    pub fn diff(
        &self,
        desired: &Graph,
        current: &StateDocument,
    ) -> Result<Vec<EditOp>, ValidationError> {
        let mut ops = Vec::new();
        // Resources that get a new provider identity in this run.
        let mut fresh: BTreeSet<ResourceId> = BTreeSet::new();

        for id in desired.topological_order()? {
            let Some(resource) = desired.get(&id) else {
                continue;
            };

            let Some(record) = current.get(&id) else {
                debug!("{id} needs to be created");
                fresh.insert(id);
                ops.push(EditOp::Create {
                    resource: resource.clone(),
                });
                continue;
            };

            let changes = self.compare(resource, record, &fresh);
            if changes.is_empty() {
                if resource.dependencies() != record.dependencies {
                    debug!("{id} only changed its dependencies");
                    ops.push(EditOp::Update {
                        resource: resource.clone(),
                        provider_id: record.provider_id.clone(),
                        changes,
                        previous_dependencies: record.dependencies.clone(),
                    });
                } else {
                    debug!("{id} is up to date");
                }
                continue;
            }

            if changes.iter().any(|c| c.forces_replacement) {
                debug!("{id} needs replacement");
                fresh.insert(id);
                ops.push(EditOp::Replace {
                    resource: resource.clone(),
                    old_provider_id: record.provider_id.clone(),
                    changes,
                    previous_dependencies: record.dependencies.clone(),
                });
            } else {
                debug!("{id} needs update");
                ops.push(EditOp::Update {
                    resource: resource.clone(),
                    provider_id: record.provider_id.clone(),
                    changes,
                    previous_dependencies: record.dependencies.clone(),
                });
            }
        }

        for (id, record) in &current.records {
            if !desired.contains(id) {
                debug!("{id} was removed from configuration");
                ops.push(EditOp::Delete {
                    id: id.clone(),
                    provider_id: record.provider_id.clone(),
                    previous_dependencies: record.dependencies.clone(),
                    deposed: false,
                });
            }
        }

        for object in &current.deposed {
            debug!("{} has a deposed object {}", object.id, object.provider_id);
            ops.push(EditOp::Delete {
                id: object.id.clone(),
                provider_id: object.provider_id.clone(),
                previous_dependencies: BTreeSet::new(),
                deposed: true,
            });
        }

        Ok(ops)
    }

    /// Compares declared properties with the last applied ones.
    ///
    /// A field referencing a resource in `fresh` counts as changed: its
    /// resolved value will differ even though the declaration did not.
    fn compare(
        &self,
        resource: &Resource,
        record: &StateRecord,
        fresh: &BTreeSet<ResourceId>,
    ) -> Vec<FieldChange> {
        let fields: BTreeSet<&String> = resource
            .properties
            .keys()
            .chain(record.properties.keys())
            .collect();

        fields
            .into_iter()
            .filter(|field| !resource.lifecycle.ignore_changes.contains(*field))
            .filter_map(|field| {
                let old = record.properties.get(field);
                let new = resource.properties.get(field);
                let moved = new.is_some_and(|v| v.references_any(|r| fresh.contains(&r.target)));

                (old != new || moved).then(|| FieldChange {
                    field: field.clone(),
                    old: old.cloned(),
                    new: new.cloned(),
                    forces_replacement: self.forces_replacement(resource, field),
                })
            })
            .collect()
    }

    /// Returns true if a change to `field` forces a new object.
    fn forces_replacement(&self, resource: &Resource, field: &str) -> bool {
        resource.lifecycle.replace_on.contains(field)
            || self
                .replace_triggers
                .get(&resource.id.resource_type)
                .is_some_and(|fields| fields.contains(field))
    }
}

impl EditOp {
    /// Returns the resource the edit applies to.
    #[must_use]
    pub const fn id(&self) -> &ResourceId {
        match self {
            Self::Create { resource }
            | Self::Update { resource, .. }
            | Self::Replace { resource, .. } => &resource.id,
            Self::Delete { id, .. } => id,
        }
    }

    /// Returns the changed fields, empty for creates and deletes.
    #[must_use]
    pub fn changes(&self) -> &[FieldChange] {
        match self {
            Self::Update { changes, .. } | Self::Replace { changes, .. } => changes,
            Self::Create { .. } | Self::Delete { .. } => &[],
        }
    }
}

impl std::fmt::Display for FieldChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
        write!(f, "{}: {} -> {}", self.field, show(&self.old), show(&self.new))?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for EditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create { resource } => write!(f, "create {}", resource.id),
            Self::Update { resource, .. } => write!(f, "update {}", resource.id),
            Self::Replace { resource, .. } => write!(f, "replace {}", resource.id),
            Self::Delete { id, deposed: true, provider_id, .. } => {
                write!(f, "delete {id} (deposed {provider_id})")
            }
            Self::Delete { id, .. } => write!(f, "delete {id}"),
        }
    }
}
