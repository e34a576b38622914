//! Resource model: identities, property values and the desired graph.

mod graph;
mod resource;

pub use graph::Graph;
pub use resource::{ID_ATTR, Lifecycle, Reference, ReplaceStrategy, Resource, ResourceId, Value};
