use serde::Serialize;
use snapsort_merge::MergeResult;
use snapsort_simmath::ItemId;
use snapsort_task::GenerationToken;

/// Notifications for whoever mirrors engine state (a UI, a cache).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Sent before a stack regeneration starts. The listed ids are retired
    /// once the new set lands and must not be referenced any more.
    StacksInvalidated { scope: String, stack_ids: Vec<u64> },

    ClustersReplaced {
        scope: String,
        generation: u64,
        branch_keys: Vec<String>,
        noise: Vec<ItemId>,
        skipped: usize,
    },

    StacksReplaced {
        scope: String,
        generation: u64,
        stack_ids: Vec<u64>,
        skipped: usize,
    },

    MergeApplied {
        scope: String,
        target: String,
        sources: Vec<String>,
        result: MergeResult,
    },

    MergeUndone { scope: String, target: String },

    /// A result that lost against a newer generation. Informational only.
    Discarded { token: GenerationToken },
}
