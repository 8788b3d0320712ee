use std::collections::BTreeSet;

use chrono::Utc;
use snapsort_simmath::ItemId;
use tracing::{debug, info, warn};

use crate::error::MergeError;
use crate::group::{Group, GroupSet, MemberIndex};
use crate::record::{MergeOutcome, MergeRecord, MergeResult, ReassignResult, SplitResult};

/// Applies user edits to a group set.
///
/// Operations never touch the input set. Each returns a full replacement,
/// so a failed or discarded operation leaves nothing half-applied.
pub struct MergeReconciler<'a> {
    index: &'a dyn MemberIndex,
}

impl<'a> MergeReconciler<'a> {
    pub fn new(index: &'a dyn MemberIndex) -> Self {
        Self { index }
    }

    /// Folds `sources` into `target`.
    ///
    /// A source member whose photo already appears in the target is a
    /// duplicate: it leaves the source but is not added to the target. Each
    /// source is removed afterwards. The target keeps its representative.
    ///
    /// Sources equal to the target are ignored. Sources missing from the set
    /// are treated as already merged, so replaying a merge is a no-op.
    pub fn merge<G: Group>(
        &self,
        groups: &GroupSet<G>,
        target: &G::Key,
        sources: &[G::Key],
    ) -> Result<MergeOutcome<G>, MergeError> {
        let Some(target_group) = groups.get(target) else {
            return Err(MergeError::TargetNotFound(target.to_string()));
        };

        let mut seen = BTreeSet::new();
        let live: Vec<&G> = sources
            .iter()
            .filter(|k| *k != target && seen.insert((*k).clone()))
            .filter_map(|k| match groups.get(k) {
                Some(g) => Some(g),
                None => {
                    debug!(source = %k, "merge source already gone");
                    None
                }
            })
            .collect();

        if live.is_empty() {
            return Ok(MergeOutcome {
                groups: groups.clone(),
                result: MergeResult {
                    total_photos: self.photo_count(&target_group.members()),
                    ..Default::default()
                },
                record: None,
            });
        }

        let mut members = target_group.members();
        let mut photos: BTreeSet<ItemId> =
            members.iter().map(|&id| self.index.photo_of(id)).collect();
        let mut result = MergeResult::default();

        for source in &live {
            for id in source.members() {
                result.moved_faces += 1;
                if photos.insert(self.index.photo_of(id)) {
                    members.push(id);
                    result.unique_moved += 1;
                } else {
                    result.duplicates_found += 1;
                }
            }
        }
        result.total_photos = photos.len();

        let mut next = groups.clone();
        for source in &live {
            next.remove(source.key());
        }
        let mut merged = target_group.clone();
        merged.rebuild(members, target_group.representative(), self.index);
        let target_after = merged.members();
        next.insert(target.clone(), merged);

        info!(
            target = %target,
            sources = live.len(),
            moved = result.moved_faces,
            duplicates = result.duplicates_found,
            unique = result.unique_moved,
            total_photos = result.total_photos,
            "merge computed"
        );

        let record = MergeRecord {
            target: target.clone(),
            sources: live.iter().map(|g| g.key().clone()).collect(),
            moved_count: result.moved_faces,
            duplicate_count: result.duplicates_found,
            unique_moved_count: result.unique_moved,
            timestamp: Utc::now(),
            target_before: target_group.clone(),
            sources_before: live.iter().map(|g| (*g).clone()).collect(),
            target_after,
        };

        Ok(MergeOutcome {
            groups: next,
            result,
            record: Some(record),
        })
    }

    /// Restores the target and sources of `record` to their pre-merge
    /// membership, including members dropped as duplicates.
    ///
    /// Refuses when the target changed since the merge, when a source key
    /// is taken again, or when a member to restore now belongs elsewhere.
    pub fn undo<G: Group>(
        &self,
        groups: &GroupSet<G>,
        record: &MergeRecord<G>,
    ) -> Result<GroupSet<G>, MergeError> {
        let conflict = |reason: String| MergeError::UndoConflict {
            key: record.target.to_string(),
            reason,
        };

        let Some(current) = groups.get(&record.target) else {
            return Err(MergeError::TargetNotFound(record.target.to_string()));
        };
        if current.members() != record.target_after {
            return Err(conflict("target membership changed since the merge".into()));
        }
        for source in &record.sources_before {
            if groups.contains_key(source.key()) {
                return Err(conflict(format!("key {} is in use again", source.key())));
            }
        }

        let restoring: BTreeSet<ItemId> = record
            .sources_before
            .iter()
            .flat_map(|g| g.members())
            .chain(record.target_before.members())
            .collect();
        for (key, g) in groups {
            if *key == record.target {
                continue;
            }
            if let Some(id) = g.members().into_iter().find(|id| restoring.contains(id)) {
                return Err(conflict(format!("member {id} now belongs to {key}")));
            }
        }

        let mut next = groups.clone();
        next.insert(record.target.clone(), record.target_before.clone());
        for source in &record.sources_before {
            next.insert(source.key().clone(), source.clone());
        }
        info!(target = %record.target, sources = record.sources.len(), "merge undone");
        Ok(next)
    }

    /// Moves `subset` out of `key` into a new group under `new_key`. Both
    /// sides get a freshly picked representative.
    pub fn split<G: Group>(
        &self,
        groups: &GroupSet<G>,
        key: &G::Key,
        subset: &BTreeSet<ItemId>,
        new_key: G::Key,
    ) -> Result<(GroupSet<G>, SplitResult<G::Key>), MergeError> {
        let invalid = |reason: &str| MergeError::InvalidSplit {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let Some(group) = groups.get(key) else {
            return Err(MergeError::TargetNotFound(key.to_string()));
        };
        if groups.contains_key(&new_key) {
            return Err(invalid("new key already exists"));
        }
        if subset.is_empty() {
            return Err(invalid("empty subset"));
        }
        if let Some(id) = subset.iter().find(|&&id| !group.contains(id)) {
            return Err(MergeError::InvalidSplit {
                key: key.to_string(),
                reason: format!("member {id} is not in the group"),
            });
        }

        let (moved, kept): (Vec<ItemId>, Vec<ItemId>) =
            group.members().into_iter().partition(|id| subset.contains(id));
        if kept.is_empty() {
            return Err(invalid("subset covers the whole group"));
        }

        let kept_rep = self.representative_of(&kept);
        let moved_rep = self.representative_of(&moved);

        let created = group.derive(new_key.clone(), moved, moved_rep, self.index);
        let mut remaining = group.clone();
        remaining.rebuild(kept, kept_rep, self.index);

        let mut next = groups.clone();
        next.insert(key.clone(), remaining);
        next.insert(new_key.clone(), created);

        info!(from = %key, to = %new_key, moved = subset.len(), "group split");
        Ok((
            next,
            SplitResult {
                remaining: key.clone(),
                created: new_key,
                remaining_representative: kept_rep,
                created_representative: moved_rep,
            },
        ))
    }

    /// Moves `ids` into `target`, wherever they currently are. Ids not in any
    /// group are added as well, as long as the index knows them; unknown ids
    /// are reported in `skipped`. Groups left empty are removed; groups that
    /// lost their representative get a new one.
    pub fn reassign<G: Group>(
        &self,
        groups: &GroupSet<G>,
        ids: &[ItemId],
        target: &G::Key,
    ) -> Result<(GroupSet<G>, ReassignResult<G::Key>), MergeError> {
        let Some(target_group) = groups.get(target) else {
            return Err(MergeError::TargetNotFound(target.to_string()));
        };

        let mut result = ReassignResult::default();
        let mut incoming: Vec<ItemId> = Vec::new();
        for &id in ids {
            if target_group.contains(id) {
                result.unchanged += 1;
            } else if !self.index.knows(id) {
                if !result.skipped.contains(&id) {
                    result.skipped.push(id);
                }
            } else if !incoming.contains(&id) {
                incoming.push(id);
            }
        }
        if !result.skipped.is_empty() {
            warn!(target = %target, skipped = ?result.skipped, "unknown ids not reassigned");
        }
        if incoming.is_empty() {
            return Ok((groups.clone(), result));
        }
        result.moved = incoming.len();

        let mut next = groups.clone();
        for (key, g) in groups {
            if key == target || !incoming.iter().any(|&id| g.contains(id)) {
                continue;
            }
            let kept: Vec<ItemId> = g
                .members()
                .into_iter()
                .filter(|id| !incoming.contains(id))
                .collect();
            if kept.is_empty() {
                next.remove(key);
                result.removed.push(key.clone());
                continue;
            }
            let rep = if kept.contains(&g.representative()) {
                g.representative()
            } else {
                self.representative_of(&kept)
            };
            let mut shrunk = g.clone();
            shrunk.rebuild(kept, rep, self.index);
            next.insert(key.clone(), shrunk);
        }

        let mut members = target_group.members();
        members.extend(incoming);
        let mut grown = target_group.clone();
        grown.rebuild(members, target_group.representative(), self.index);
        next.insert(target.clone(), grown);

        if !result.removed.is_empty() {
            warn!(target = %target, removed = result.removed.len(), "reassignment emptied groups");
        }
        info!(target = %target, moved = result.moved, "members reassigned");
        Ok((next, result))
    }

    fn photo_count(&self, members: &[ItemId]) -> usize {
        members
            .iter()
            .map(|&id| self.index.photo_of(id))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Falls back to the smallest id when the index has no opinion.
    fn representative_of(&self, members: &[ItemId]) -> ItemId {
        self.index
            .pick_representative(members)
            .filter(|id| members.contains(id))
            .or_else(|| members.iter().copied().min())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use snapsort_cluster::Cluster;
    use snapsort_stack::{Stack, StackParams};

    use super::*;

    /// Faces keyed by id, each pointing at a photo. Representatives are the
    /// highest-quality member, ties to the smallest id.
    #[derive(Default)]
    struct Index {
        photo: HashMap<ItemId, ItemId>,
        quality: HashMap<ItemId, f32>,
        vectors: HashMap<ItemId, Vec<f32>>,
    }

    impl MemberIndex for Index {
        fn photo_of(&self, id: ItemId) -> ItemId {
            self.photo.get(&id).copied().unwrap_or(id)
        }

        fn pick_representative(&self, members: &[ItemId]) -> Option<ItemId> {
            let mut sorted = members.to_vec();
            sorted.sort_unstable();
            sorted.into_iter().fold(None, |best: Option<(ItemId, f32)>, id| {
                let q = self.quality.get(&id).copied().unwrap_or(0.0);
                match best {
                    Some((_, bq)) if bq >= q => best,
                    _ => Some((id, q)),
                }
            })
            .map(|(id, _)| id)
        }

        fn similarity(&self, a: ItemId, b: ItemId) -> Option<f32> {
            let (va, vb) = (self.vectors.get(&a)?, self.vectors.get(&b)?);
            Some(va.iter().zip(vb).map(|(x, y)| x * y).sum())
        }

        fn knows(&self, id: ItemId) -> bool {
            self.photo.contains_key(&id) || self.vectors.contains_key(&id)
        }
    }

    fn cluster(key: &str, members: &[ItemId]) -> Cluster {
        Cluster::new(key, members.iter().copied().collect(), members[0])
    }

    fn set(groups: Vec<Cluster>) -> GroupSet<Cluster> {
        groups.into_iter().map(|g| (g.branch_key.clone(), g)).collect()
    }

    // Photo ids A=1, B=2, C=3, D=4. One face per photo per cluster.
    fn abc_bcd() -> (Index, GroupSet<Cluster>) {
        let mut index = Index::default();
        for (face, photo) in [(11, 1), (12, 2), (13, 3), (22, 2), (23, 3), (24, 4)] {
            index.photo.insert(face, photo);
        }
        let groups = set(vec![
            cluster("person:001", &[11, 12, 13]),
            cluster("person:002", &[22, 23, 24]),
        ]);
        (index, groups)
    }

    #[test]
    fn merge_counts_duplicates_by_photo() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);
        let out = r
            .merge(&groups, &"person:001".to_string(), &["person:002".to_string()])
            .unwrap();

        assert_eq!(
            out.result,
            MergeResult {
                moved_faces: 3,
                duplicates_found: 2,
                unique_moved: 1,
                total_photos: 4,
            }
        );
        assert_eq!(out.groups.len(), 1);
        let target = &out.groups["person:001"];
        assert_eq!(target.members(), vec![11, 12, 13, 24]);
        assert_eq!(target.representative_id, 11);
        assert!(target.centroid().is_none());

        let record = out.record.unwrap();
        assert_eq!(record.sources, vec!["person:002".to_string()]);
        assert_eq!(record.duplicate_count, 2);
        assert_eq!(record.dropped_duplicates(), vec![22, 23]);

        // Input untouched.
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn merge_accounting_holds_for_many_sources() {
        let mut index = Index::default();
        for (face, photo) in [(1, 10), (2, 11), (3, 10), (4, 12), (5, 11), (6, 13), (7, 13)] {
            index.photo.insert(face, photo);
        }
        let groups = set(vec![
            cluster("person:001", &[1, 2]),
            cluster("person:002", &[3, 4]),
            cluster("person:003", &[5, 6, 7]),
        ]);
        let out = MergeReconciler::new(&index)
            .merge(
                &groups,
                &"person:001".to_string(),
                &["person:002".to_string(), "person:003".to_string()],
            )
            .unwrap();

        let r = out.result;
        assert_eq!(r.moved_faces, 5);
        assert_eq!(r.duplicates_found + r.unique_moved, r.moved_faces);
        // 7 shares photo 13 with 6, which lands first.
        assert_eq!(r.unique_moved, 2);
        assert_eq!(r.total_photos, 4);
        assert_eq!(out.groups["person:001"].members(), vec![1, 2, 4, 6]);
    }

    #[test]
    fn self_merge_is_a_no_op() {
        let (index, groups) = abc_bcd();
        let key = "person:001".to_string();
        let out = MergeReconciler::new(&index)
            .merge(&groups, &key, &[key.clone()])
            .unwrap();
        assert_eq!(out.result.moved_faces, 0);
        assert_eq!(out.result.total_photos, 3);
        assert!(out.record.is_none());
        assert_eq!(out.groups, groups);
    }

    #[test]
    fn replayed_merge_is_a_no_op() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);
        let target = "person:001".to_string();
        let sources = ["person:002".to_string()];
        let first = r.merge(&groups, &target, &sources).unwrap();
        let again = r.merge(&first.groups, &target, &sources).unwrap();
        assert!(again.record.is_none());
        assert_eq!(again.groups, first.groups);
    }

    #[test]
    fn missing_target_is_an_error() {
        let (index, groups) = abc_bcd();
        let err = MergeReconciler::new(&index)
            .merge(&groups, &"person:404".to_string(), &["person:002".to_string()])
            .unwrap_err();
        assert_eq!(err, MergeError::TargetNotFound("person:404".into()));
    }

    #[test]
    fn undo_restores_pre_merge_membership() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);
        let out = r
            .merge(&groups, &"person:001".to_string(), &["person:002".to_string()])
            .unwrap();
        let record = out.record.unwrap();
        let restored = r.undo(&out.groups, &record).unwrap();
        assert_eq!(restored, groups);
    }

    #[test]
    fn undo_refuses_after_later_edits() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);
        let out = r
            .merge(&groups, &"person:001".to_string(), &["person:002".to_string()])
            .unwrap();
        let record = out.record.unwrap();

        let (edited, _) = r
            .split(&out.groups, &"person:001".to_string(), &BTreeSet::from([24]), "person:003".into())
            .unwrap();
        assert!(matches!(r.undo(&edited, &record), Err(MergeError::UndoConflict { .. })));

        // A duplicate that was dropped and then filed elsewhere blocks undo too.
        let mut elsewhere = out.groups.clone();
        elsewhere.insert("person:009".into(), cluster("person:009", &[22]));
        assert!(matches!(r.undo(&elsewhere, &record), Err(MergeError::UndoConflict { .. })));
    }

    #[test]
    fn split_repicks_both_representatives() {
        let (mut index, groups) = abc_bcd();
        index.quality.extend([(12, 0.9), (13, 0.5), (11, 0.4)]);
        let r = MergeReconciler::new(&index);
        let (next, res) = r
            .split(&groups, &"person:001".to_string(), &BTreeSet::from([12]), "person:003".into())
            .unwrap();

        assert_eq!(next["person:001"].members(), vec![11, 13]);
        assert_eq!(next["person:001"].representative_id, 13);
        assert_eq!(next["person:003"].members(), vec![12]);
        assert_eq!(res.created_representative, 12);
        assert_eq!(res.remaining_representative, 13);
    }

    #[test]
    fn split_rejects_bad_subsets() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);
        let key = "person:001".to_string();
        for subset in [BTreeSet::new(), BTreeSet::from([99]), BTreeSet::from([11, 12, 13])] {
            assert!(matches!(
                r.split(&groups, &key, &subset, "person:003".into()),
                Err(MergeError::InvalidSplit { .. })
            ));
        }
        assert!(matches!(
            r.split(&groups, &key, &BTreeSet::from([11]), "person:002".into()),
            Err(MergeError::InvalidSplit { .. })
        ));
    }

    #[test]
    fn reassign_moves_and_cleans_up() {
        let (mut index, groups) = abc_bcd();
        index.photo.insert(31, 5);
        index.photo.insert(40, 6);
        let mut groups = groups;
        groups.insert("person:003".into(), cluster("person:003", &[31]));
        let r = MergeReconciler::new(&index);

        // 40 is in no group yet; it is still a known face.
        let (next, res) = r
            .reassign(&groups, &[22, 31, 40, 11], &"person:001".to_string())
            .unwrap();
        assert_eq!(res.moved, 3);
        assert_eq!(res.unchanged, 1);
        assert!(res.skipped.is_empty());
        assert_eq!(res.removed, vec!["person:003".to_string()]);
        assert_eq!(next["person:001"].members(), vec![11, 12, 13, 22, 31, 40]);
        // person:002 lost its representative (22).
        assert_eq!(next["person:002"].members(), vec![23, 24]);
        assert_eq!(next["person:002"].representative_id, 23);
    }

    #[test]
    fn reassign_skips_unknown_ids() {
        let (index, groups) = abc_bcd();
        let r = MergeReconciler::new(&index);

        let (next, res) = r
            .reassign(&groups, &[987_654, 24, 987_654], &"person:001".to_string())
            .unwrap();
        assert_eq!(res.moved, 1);
        assert_eq!(res.skipped, vec![987_654]);
        assert_eq!(next["person:001"].members(), vec![11, 12, 13, 24]);
        assert!(next.values().all(|g| !g.contains(987_654)));

        let (same, res) = r
            .reassign(&groups, &[987_654], &"person:001".to_string())
            .unwrap();
        assert_eq!(res.moved, 0);
        assert_eq!(same["person:001"].members(), vec![11, 12, 13]);
    }

    #[test]
    fn stack_merge_rescores_against_representative() {
        let mut index = Index::default();
        index.vectors.insert(1, vec![1.0, 0.0]);
        index.vectors.insert(2, vec![0.96, 0.28]);
        index.vectors.insert(3, vec![0.8, 0.6]);

        let stack = |id: u64, members: Vec<ItemId>| Stack {
            stack_id: id,
            representative_id: members[0],
            similarity_scores: members.iter().map(|&m| (m, 1.0)).collect::<BTreeMap<_, _>>(),
            member_ids: members,
            generation_params: StackParams::default(),
        };
        let groups: GroupSet<Stack> =
            BTreeMap::from([(1, stack(1, vec![1, 2])), (2, stack(2, vec![3]))]);

        let out = MergeReconciler::new(&index).merge(&groups, &1, &[2]).unwrap();
        let merged = &out.groups[&1];
        assert_eq!(merged.member_ids, vec![1, 2, 3]);
        assert_eq!(merged.score_of(1), Some(1.0));
        assert!((merged.score_of(2).unwrap() - 0.96).abs() < 1e-6);
        assert!((merged.score_of(3).unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn record_round_trips_through_json() {
        let (index, groups) = abc_bcd();
        let out = MergeReconciler::new(&index)
            .merge(&groups, &"person:001".to_string(), &["person:002".to_string()])
            .unwrap();
        let record = out.record.unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: MergeRecord<Cluster> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target, record.target);
        assert_eq!(back.dropped_duplicates(), vec![22, 23]);
    }
}
