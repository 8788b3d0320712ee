use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snapsort_cluster::Cluster;
use snapsort_simmath::ItemId;
use snapsort_stack::Stack;

/// What the reconciler needs to know about members it does not own.
pub trait MemberIndex {
    /// The photo a member belongs to. Faces map to their photo; for photo
    /// groups the member is the photo itself.
    fn photo_of(&self, id: ItemId) -> ItemId;

    /// Best representative among `members`, or `None` when none qualifies.
    fn pick_representative(&self, members: &[ItemId]) -> Option<ItemId>;

    /// Cosine similarity between two members, if both vectors are known.
    fn similarity(&self, a: ItemId, b: ItemId) -> Option<f32>;

    /// Whether `id` is an item of the scope's input at all.
    fn knows(&self, id: ItemId) -> bool;
}

/// A keyed set of members with a representative. Implemented by person
/// clusters and shot stacks so both share one merge/split path.
pub trait Group: Clone + Serialize + DeserializeOwned {
    type Key: Clone + Ord + fmt::Display + fmt::Debug + Serialize + DeserializeOwned;

    fn key(&self) -> &Self::Key;

    /// Members in the group's own order.
    fn members(&self) -> Vec<ItemId>;

    fn representative(&self) -> ItemId;

    /// Replaces membership wholesale and drops or recomputes whatever was
    /// derived from the old membership.
    fn rebuild(&mut self, members: Vec<ItemId>, representative: ItemId, index: &dyn MemberIndex);

    /// A new group under `key` that otherwise carries this group's settings.
    fn derive(
        &self,
        key: Self::Key,
        members: Vec<ItemId>,
        representative: ItemId,
        index: &dyn MemberIndex,
    ) -> Self {
        let mut g = self.clone();
        g.set_key(key);
        g.rebuild(members, representative, index);
        g
    }

    fn set_key(&mut self, key: Self::Key);

    fn contains(&self, id: ItemId) -> bool {
        self.members().contains(&id)
    }

    fn len(&self) -> usize {
        self.members().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A complete group set keyed by group key.
pub type GroupSet<G> = BTreeMap<<G as Group>::Key, G>;

impl Group for Cluster {
    type Key = String;

    fn key(&self) -> &String {
        &self.branch_key
    }

    fn members(&self) -> Vec<ItemId> {
        self.member_ids.iter().copied().collect()
    }

    fn representative(&self) -> ItemId {
        self.representative_id
    }

    fn rebuild(&mut self, members: Vec<ItemId>, representative: ItemId, _: &dyn MemberIndex) {
        self.member_ids = members.into_iter().collect::<BTreeSet<_>>();
        self.representative_id = representative;
        self.invalidate_centroid();
    }

    fn set_key(&mut self, key: String) {
        self.branch_key = key;
    }

    fn contains(&self, id: ItemId) -> bool {
        self.member_ids.contains(&id)
    }

    fn len(&self) -> usize {
        self.member_ids.len()
    }
}

impl Group for Stack {
    type Key = u64;

    fn key(&self) -> &u64 {
        &self.stack_id
    }

    fn members(&self) -> Vec<ItemId> {
        self.member_ids.clone()
    }

    fn representative(&self) -> ItemId {
        self.representative_id
    }

    /// Scores are recomputed against the new representative. A member whose
    /// vector is unknown keeps its stored score.
    fn rebuild(&mut self, members: Vec<ItemId>, representative: ItemId, index: &dyn MemberIndex) {
        let scores = members
            .iter()
            .map(|&id| {
                let score = if id == representative {
                    1.0
                } else {
                    index
                        .similarity(representative, id)
                        .or_else(|| self.similarity_scores.get(&id).copied())
                        .unwrap_or(0.0)
                        .clamp(0.0, 1.0)
                };
                (id, score)
            })
            .collect();
        self.member_ids = members;
        self.representative_id = representative;
        self.similarity_scores = scores;
    }

    fn set_key(&mut self, key: u64) {
        self.stack_id = key;
    }

    fn contains(&self, id: ItemId) -> bool {
        self.member_ids.contains(&id)
    }

    fn len(&self) -> usize {
        self.member_ids.len()
    }
}
