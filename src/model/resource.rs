//! Resource types for the desired graph.
//!
//! A resource is a flat record: identity, property values and explicit
//! dependency edges. References between resources are ordinary property
//! values, which is how dependencies are inferred.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Output name that resolves to the provider-assigned identity.
pub const ID_ATTR: &str = "id";

/// Identity of a resource: `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type (e.g. `compute_instance`).
    pub resource_type: String,
    /// Logical name, unique per type within a graph.
    pub name: String,
}

/// A property value.
///
/// Variant order matters: a map with exactly the keys `ref` (and optionally
/// `attr`) is a reference, anything else is a plain map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Reference to another resource's identity or output.
    Ref(Reference),
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Integer(i64),
    /// Floating point scalar.
    Float(f64),
    /// String scalar.
    String(String),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
}

/// Reference to an output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    /// Referenced resource.
    #[serde(rename = "ref")]
    pub target: ResourceId,
    /// Output name; `id` means the provider-assigned identity.
    #[serde(default = "default_attr")]
    pub attr: String,
}

/// How a resource is replaced when a replacement-triggering field changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Delete the old object, then create the new one.
    #[default]
    DestroyBeforeCreate,
    /// Create the new object, move dependents, then delete the old one.
    CreateBeforeDestroy,
}

/// Per-resource lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Fields whose change forces a replacement.
    #[serde(default)]
    pub replace_on: BTreeSet<String>,
    /// Fields never compared by the differ.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
    /// Overrides the stack-wide replace strategy.
    #[serde(default)]
    pub replace_strategy: Option<ReplaceStrategy>,
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Resource identity.
    pub id: ResourceId,
    /// Declared property values.
    pub properties: BTreeMap<String, Value>,
    /// Explicit dependencies.
    pub depends_on: BTreeSet<ResourceId>,
    /// Lifecycle settings.
    pub lifecycle: Lifecycle,
}

fn default_attr() -> String {
    String::from(ID_ATTR)
}

impl ResourceId {
    /// Creates a resource identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses `type.name`.
    ///
    /// # Errors
    ///
    /// Returns a message if the string has no separator or an empty part.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s.split_once('.') {
            Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(format!("invalid resource id '{s}': expected 'type.name'")),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl Reference {
    /// Creates a reference to the provider identity of `target`.
    #[must_use]
    pub fn id_of(target: ResourceId) -> Self {
        Self {
            target,
            attr: default_attr(),
        }
    }

    /// Creates a reference to a named output of `target`.
    #[must_use]
    pub fn output(target: ResourceId, attr: impl Into<String>) -> Self {
        Self {
            target,
            attr: attr.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attr)
    }
}

impl Value {
    /// Collects every reference nested in this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
            Self::Bool(_) | Self::Integer(_) | Self::Float(_) | Self::String(_) => {}
        }
    }

    /// Returns true if any nested reference satisfies `pred`.
    pub fn references_any(&self, pred: impl Fn(&Reference) -> bool) -> bool {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs.into_iter().any(pred)
    }

    /// Replaces every reference with the value returned by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` cannot resolve.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Self, Reference>
    where
        F: Fn(&Reference) -> Option<Self>,
    {
        match self {
            Self::Ref(reference) => lookup(reference).ok_or_else(|| reference.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(entries) => entries
                .iter()
                .map(|(key, item)| item.resolve(lookup).map(|v| (key.clone(), v)))
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            Self::Bool(_) | Self::Integer(_) | Self::Float(_) | Self::String(_) => Ok(self.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(reference) => write!(f, "${{{reference}}}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).unwrap_or_default();
                write!(f, "{json}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Self::Ref(reference)
    }
}

impl Resource {
    /// Creates a resource with no properties or dependencies.
    #[must_use]
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.depends_on.insert(id);
        self
    }

    /// Sets the lifecycle.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Returns `(field, reference)` pairs for every reference in the properties.
    #[must_use]
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        let mut pairs = Vec::new();
        for (field, value) in &self.properties {
            let mut refs = Vec::new();
            value.collect_references(&mut refs);
            pairs.extend(refs.into_iter().map(|r| (field.as_str(), r)));
        }
        pairs
    }

    /// Returns explicit and inferred dependencies.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.depends_on.clone();
        deps.extend(self.references().into_iter().map(|(_, r)| r.target.clone()));
        deps
    }
}
