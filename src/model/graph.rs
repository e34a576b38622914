//! The desired resource graph and its validation.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::ValidationError;

use super::resource::{Resource, ResourceId};

/// A set of resources with dependency edges.
///
/// Resources keep their declaration order; lookups go through an index of
/// the first declaration of each id.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Resources in declaration order.
    resources: Vec<Resource>,
    /// Position of the first declaration of each id.
    index: HashMap<ResourceId, usize>,
}

/// Visit marks for the depth-first traversal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the current recursion stack.
    Active,
    /// Fully explored.
    Done,
}

impl Graph {
    /// Creates a graph from resources.
    #[must_use]
    pub fn new(resources: Vec<Resource>) -> Self {
        let mut index = HashMap::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            index.entry(resource.id.clone()).or_insert(i);
        }
        Self { resources, index }
    }

    /// Creates an empty graph (used to plan a destroy).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the resource with the given id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    /// Returns true if the graph declares `id`.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterates resources in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are declared.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the dependencies of `id` (explicit and inferred).
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.get(id).map(Resource::dependencies).unwrap_or_default()
    }

    /// Validates uniqueness, reference resolution and acyclicity.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(&resource.id) {
                return Err(ValidationError::DuplicateResource {
                    id: resource.id.clone(),
                });
            }
        }

        for resource in &self.resources {
            for target in &resource.depends_on {
                if !self.contains(target) {
                    return Err(ValidationError::UnresolvedReference {
                        source_id: resource.id.clone(),
                        field: String::from("depends_on"),
                        target: target.clone(),
                    });
                }
            }
            for (field, reference) in resource.references() {
                if !self.contains(&reference.target) {
                    return Err(ValidationError::UnresolvedReference {
                        source_id: resource.id.clone(),
                        field: field.to_string(),
                        target: reference.target.clone(),
                    });
                }
            }
        }

        self.topological_order().map(|order| {
            debug!("Validated graph of {} resources", order.len());
        })
    }

    /// Returns resource ids with every dependency before its dependents.
    ///
    /// Roots are visited in sorted order so the result is deterministic.
    /// Dependencies on undeclared resources are ignored here.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Cycle`] naming the cycle found.
    pub fn topological_order(&self) -> Result<Vec<ResourceId>, ValidationError> {
        let mut roots: Vec<&ResourceId> = self.index.keys().collect();
        roots.sort();

        let mut marks: HashMap<ResourceId, Mark> = HashMap::new();
        let mut stack: Vec<ResourceId> = Vec::new();
        let mut order = Vec::with_capacity(self.index.len());

        for root in roots {
            self.visit(root, &mut marks, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    /// Depth-first visit carrying the recursion stack.
    fn visit(
        &self,
        id: &ResourceId,
        marks: &mut HashMap<ResourceId, Mark>,
        stack: &mut Vec<ResourceId>,
        order: &mut Vec<ResourceId>,
    ) -> Result<(), ValidationError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Active) => {
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle: Vec<ResourceId> = stack[start..].to_vec();
                cycle.push(id.clone());
                return Err(ValidationError::Cycle { cycle });
            }
            None => {}
        }

        marks.insert(id.clone(), Mark::Active);
        stack.push(id.clone());

        for dep in self.dependencies(id) {
            if self.contains(&dep) {
                self.visit(&dep, marks, stack, order)?;
            }
        }

        stack.pop();
        marks.insert(id.clone(), Mark::Done);
        order.push(id.clone());
        Ok(())
    }
}
