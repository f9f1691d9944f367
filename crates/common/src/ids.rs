//! Typed identifiers shared across planner/runtime components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable job identifier; one job per executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a collect or merge stage within one plan.
///
/// Stages reference each other by this id rather than by pointer because the
/// descriptors are shipped to other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionNodeId(
    /// Raw numeric id value.
    pub i32,
);

impl fmt::Display for ExecutionNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a sub-context (one shard search handle) inside a job collect context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubContextId(
    /// Raw numeric id value.
    pub i32,
);

impl fmt::Display for SubContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(
    /// Node name as announced by cluster membership.
    pub String,
);

impl NodeId {
    /// Build a node id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
