use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapsort_simmath::ItemId;

use crate::group::{Group, GroupSet};

/// Exact accounting of a merge. `duplicates_found + unique_moved ==
/// moved_faces` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// Members taken out of the sources.
    pub moved_faces: usize,

    /// Source members whose photo was already in the target. Dropped.
    pub duplicates_found: usize,

    /// Source members that landed in the target.
    pub unique_moved: usize,

    /// Distinct photos in the target after the merge.
    pub total_photos: usize,
}

/// Undo log entry for one merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MergeRecord<G: Group> {
    pub target: G::Key,
    pub sources: Vec<G::Key>,
    pub moved_count: usize,
    pub duplicate_count: usize,
    pub unique_moved_count: usize,
    pub timestamp: DateTime<Utc>,

    /// Target as it was before the merge.
    pub(crate) target_before: G,

    /// Sources as they were before the merge.
    pub(crate) sources_before: Vec<G>,

    /// Target membership right after the merge. Undo refuses to run once
    /// the target has moved on from this.
    pub(crate) target_after: Vec<ItemId>,
}

impl<G: Group> MergeRecord<G> {
    /// Members that dropped out of every group as duplicates.
    pub fn dropped_duplicates(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .sources_before
            .iter()
            .flat_map(|g| g.members())
            .filter(|id| !self.target_after.contains(id))
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// A replacement set together with what changed.
#[derive(Debug, Clone)]
pub struct MergeOutcome<G: Group> {
    pub groups: GroupSet<G>,
    pub result: MergeResult,

    /// `None` when the merge had no effect, e.g. every source was the target
    /// itself or had already been merged.
    pub record: Option<MergeRecord<G>>,
}

/// Keys touched by a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult<K> {
    pub remaining: K,
    pub created: K,
    pub remaining_representative: ItemId,
    pub created_representative: ItemId,
}

/// What a manual reassignment did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignResult<K> {
    /// Members that changed group, including previously unassigned ones.
    pub moved: usize,

    /// Members that were already in the target.
    pub unchanged: usize,

    /// Ids the index does not know. They are left out.
    pub skipped: Vec<ItemId>,

    /// Groups that lost their last member and were removed.
    pub removed: Vec<K>,
}

impl<K> Default for ReassignResult<K> {
    fn default() -> Self {
        Self {
            moved: 0,
            unchanged: 0,
            skipped: Vec::new(),
            removed: Vec::new(),
        }
    }
}
