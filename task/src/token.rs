use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of work a scope runs. Generations are counted per (kind, name), so a
/// clustering run never supersedes a stack regeneration for the same project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Clustering,
    Stacks,
    Merge,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Clustering => "clustering",
            OperationKind::Stacks => "stacks",
            OperationKind::Merge => "merge",
        }
    }
}

/// A logical stream of requests whose results supersede one another,
/// e.g. "clustering for project X".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub kind: OperationKind,
    pub name: String,
}

impl Scope {
    pub fn new(kind: OperationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn clustering(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Clustering, name)
    }

    pub fn stacks(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Stacks, name)
    }

    pub fn merge(name: impl Into<String>) -> Self {
        Self::new(OperationKind::Merge, name)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

/// Tags a unit of work. Only the token carrying the scope's current id is
/// authoritative; every older token's result is discarded on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationToken {
    pub id: u64,
    pub scope: Scope,
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.id)
    }
}

/// Per-scope state machine:
/// `Idle -> Running(g) -> Delivered(g) | Discarded(g)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "generation", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running(u64),
    Delivered(u64),
    Discarded(u64),
}
