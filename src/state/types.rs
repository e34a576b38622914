//! Persisted state types.
//!
//! The state document is the engine's record of what was last applied:
//! one record per managed resource, the objects left behind by
//! create-before-destroy replacements, and a short run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ID_ATTR, Reference, ResourceId, Value};

/// Current version of the state format.
pub const STATE_FORMAT_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// Outputs reported by a provider for one object.
pub type Outputs = BTreeMap<String, Value>;

/// The complete state of one stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub format_version: String,
    /// Stack key (`<name>-<environment>`).
    pub stack: String,
    /// Version stamp, incremented by every successful save.
    pub version: u64,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Managed resources.
    #[serde(default)]
    pub records: BTreeMap<ResourceId, StateRecord>,
    /// Old objects awaiting deletion.
    #[serde(default)]
    pub deposed: Vec<DeposedObject>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// What the engine knows about one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider-assigned identity.
    pub provider_id: String,
    /// Declared properties as last applied (references unresolved).
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Dependencies at apply time.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An old object left behind by a create-before-destroy replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeposedObject {
    /// Resource the object belonged to.
    pub id: ResourceId,
    /// Provider-assigned identity of the old object.
    pub provider_id: String,
    /// When the object was deposed.
    pub deposed_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Configuration hash at time of the run.
    pub config_hash: String,
    /// Resources touched by successful steps.
    pub resources: Vec<String>,
    /// Whether the run completed.
    pub success: bool,
    /// Error message of a failed run.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge to the declared graph.
    Apply,
    /// Delete everything.
    Destroy,
    /// Re-read objects from the provider.
    Refresh,
}

impl StateDocument {
    /// Creates an empty state document (version 0).
    #[must_use]
    pub fn new(stack: &str) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION.to_string(),
            stack: stack.to_string(),
            version: 0,
            config_hash: String::new(),
            records: BTreeMap::new(),
            deposed: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deposed.is_empty()
    }

    /// Gets a record by resource id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: StateRecord) {
        self.records.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record.
    pub fn remove_record(&mut self, id: &ResourceId) -> Option<StateRecord> {
        let result = self.records.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Records an old object awaiting deletion.
    pub fn add_deposed(&mut self, id: ResourceId, provider_id: String) {
        self.deposed.push(DeposedObject {
            id,
            provider_id,
            deposed_at: Utc::now(),
        });
        self.last_updated = Utc::now();
    }

    /// Forgets a deposed object. Returns false if it was not recorded.
    pub fn remove_deposed(&mut self, id: &ResourceId, provider_id: &str) -> bool {
        let before = self.deposed.len();
        self.deposed
            .retain(|d| !(d.id == *id && d.provider_id == provider_id));
        let removed = self.deposed.len() != before;
        if removed {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Resolves a reference against the recorded objects.
    ///
    /// `id` yields the provider identity; any other attribute is looked up
    /// in the outputs.
    #[must_use]
    pub fn resolve_reference(&self, reference: &Reference) -> Option<Value> {
        let record = self.records.get(&reference.target)?;
        if reference.attr == ID_ATTR {
            Some(Value::String(record.provider_id.clone()))
        } else {
            record.outputs.get(&reference.attr).cloned()
        }
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all recorded resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&ResourceId> {
        self.records.keys().collect()
    }
}

impl StateRecord {
    /// Creates a record for a freshly created object.
    #[must_use]
    pub fn new(
        id: ResourceId,
        provider_id: impl Into<String>,
        properties: BTreeMap<String, Value>,
        outputs: Outputs,
        dependencies: BTreeSet<ResourceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider_id: provider_id.into(),
            properties,
            outputs,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }
}

impl RunHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}
