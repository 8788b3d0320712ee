use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use snapsort_simmath::{ItemId, SimMathError, centroid};

/// A person group: face ids believed to show the same person.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Stable identifier (e.g. "person:001"). Minted once, never reused.
    pub branch_key: String,

    pub member_ids: BTreeSet<ItemId>,

    /// Always a member.
    pub representative_id: ItemId,

    /// L2-normalized mean of the seeding members. Derived; dropped whenever
    /// membership changes and recomputed on demand.
    #[serde(skip)]
    centroid: Option<Vec<f32>>,
}

impl Cluster {
    pub fn new(
        branch_key: impl Into<String>,
        member_ids: BTreeSet<ItemId>,
        representative_id: ItemId,
    ) -> Self {
        Self {
            branch_key: branch_key.into(),
            member_ids,
            representative_id,
            centroid: None,
        }
    }

    pub(crate) fn with_centroid(mut self, centroid: Vec<f32>) -> Self {
        self.centroid = Some(centroid);
        self
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.member_ids.contains(&id)
    }

    /// The cached centroid, if still valid.
    pub fn centroid(&self) -> Option<&[f32]> {
        self.centroid.as_deref()
    }

    /// Must be called after any membership change.
    pub fn invalidate_centroid(&mut self) {
        self.centroid = None;
    }

    /// Recomputes the centroid from the members' vectors. Members the lookup
    /// cannot resolve are left out.
    pub fn refresh_centroid<'a>(
        &mut self,
        lookup: impl Fn(ItemId) -> Option<&'a [f32]>,
    ) -> Result<Option<&[f32]>, SimMathError> {
        let vectors: Vec<&[f32]> = self.member_ids.iter().filter_map(|&id| lookup(id)).collect();
        self.centroid = if vectors.is_empty() {
            None
        } else {
            Some(centroid(&vectors)?)
        };
        Ok(self.centroid.as_deref())
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("branch_key", &self.branch_key)
            .field("members", &self.member_ids.len())
            .field("representative_id", &self.representative_id)
            .field("has_centroid", &self.centroid.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn refresh_centroid_uses_members() {
        let vectors: HashMap<ItemId, Vec<f32>> =
            HashMap::from([(1, vec![1.0, 0.0]), (2, vec![0.0, 1.0]), (3, vec![-1.0, 0.0])]);
        let mut c = Cluster::new("person:001", BTreeSet::from([1, 2]), 1);
        assert!(c.centroid().is_none());

        let got = c
            .refresh_centroid(|id| vectors.get(&id).map(|v| v.as_slice()))
            .unwrap()
            .unwrap()
            .to_vec();
        let h = std::f32::consts::FRAC_1_SQRT_2;
        assert!((got[0] - h).abs() < 1e-6 && (got[1] - h).abs() < 1e-6);

        c.member_ids.insert(3);
        c.invalidate_centroid();
        assert!(c.centroid().is_none());
    }

    #[test]
    fn serde_skips_centroid() {
        let c = Cluster::new("person:002", BTreeSet::from([4, 5]), 5).with_centroid(vec![1.0]);
        let yaml = serde_yaml::to_string(&c).unwrap();
        assert!(!yaml.contains("centroid"));
        let back: Cluster = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.member_ids, c.member_ids);
        assert!(back.centroid().is_none());
    }
}
