use std::collections::{BTreeMap, BTreeSet, HashSet};

use snapsort_simmath::{IdMint, ItemId, best_by_score, centroid, cosine, dot, modal_dim};
use snapsort_task::CancelProbe;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::dbscan::{NOISE, dbscan};
use crate::error::ClusterError;
use crate::face::{FaceEmbedding, FaceScorer};
use crate::params::{ClusterConfig, ClusterParams};

/// Result of one clustering run.
#[derive(Debug, Clone, Default)]
pub struct ClusteringOutcome {
    /// Clusters in discovery order.
    pub clusters: Vec<Cluster>,

    /// Well-formed faces that ended up in no cluster, ascending.
    pub noise: Vec<ItemId>,

    /// Malformed or duplicate entries that were left out.
    pub skipped: usize,

    /// Filtered-out faces that joined a cluster through the candidate bar.
    pub assigned_candidates: usize,

    /// Parameters the run actually used.
    pub params: Option<ClusterParams>,
}

impl ClusteringOutcome {
    /// Branch key of the cluster holding `id`.
    pub fn cluster_of(&self, id: ItemId) -> Option<&str> {
        self.clusters
            .iter()
            .find(|c| c.contains(id))
            .map(|c| c.branch_key.as_str())
    }
}

/// Partitions face embeddings into person clusters.
///
/// Stateless apart from its configuration: every run works on the slice it
/// is handed and returns a complete replacement partition.
#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    cfg: ClusterConfig,
}

impl ClusteringEngine {
    pub fn new(cfg: ClusterConfig) -> Result<Self, ClusterError> {
        cfg.filter.validate()?;
        cfg.adaptive.validate()?;
        if cfg.dim == Some(0) {
            return Err(ClusterError::InvalidParameters("dim must be positive".into()));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.cfg
    }

    /// Explicit params win over the adaptive table. Explicit params are
    /// validated; they are never clamped.
    pub fn params_for(
        &self,
        count: usize,
        overrides: Option<ClusterParams>,
    ) -> Result<ClusterParams, ClusterError> {
        match overrides {
            Some(p) => {
                p.validate()?;
                Ok(p)
            }
            None => Ok(self.cfg.adaptive.select(count)),
        }
    }

    /// Clusters `faces`.
    ///
    /// Faces are processed in ascending id order, so the partition, the
    /// representatives and the minted key order depend only on the input set
    /// and the parameters. Entries with the wrong dimension, non-finite
    /// values or a repeated id are skipped and counted.
    pub fn run(
        &self,
        faces: &[FaceEmbedding],
        overrides: Option<ClusterParams>,
        mint: &IdMint,
        probe: &mut CancelProbe,
    ) -> Result<ClusteringOutcome, ClusterError> {
        if let Some(p) = overrides {
            p.validate()?;
        }
        if faces.is_empty() {
            return Ok(ClusteringOutcome {
                params: Some(self.params_for(0, overrides)?),
                ..Default::default()
            });
        }

        let (valid, skipped) = self.well_formed(faces);
        let params = self.params_for(valid.len(), overrides)?;

        let (seeds, candidates): (Vec<&FaceEmbedding>, Vec<&FaceEmbedding>) =
            valid.iter().copied().partition(|f| self.cfg.filter.passes(f));

        let seed_vectors: Vec<&[f32]> = seeds.iter().map(|f| f.vector()).collect();
        let labels = dbscan(&seed_vectors, params.eps, params.min_samples, probe)?;

        let mut groups: BTreeMap<i32, Vec<&FaceEmbedding>> = BTreeMap::new();
        let mut noise: Vec<ItemId> = Vec::new();
        for (face, &label) in seeds.iter().zip(labels.iter()) {
            if label == NOISE {
                noise.push(face.id());
            } else {
                groups.entry(label).or_default().push(*face);
            }
        }

        let mut clusters = Vec::with_capacity(groups.len());
        for members in groups.values() {
            let vectors: Vec<&[f32]> = members.iter().map(|f| f.vector()).collect();
            let center = centroid(&vectors)?;
            let scorer = FaceScorer::new(&center, members);
            let Some(rep) = best_by_score(members, &scorer, |f| f.id()) else {
                continue;
            };
            let ids: BTreeSet<ItemId> = members.iter().map(|f| f.id()).collect();
            clusters.push(
                Cluster::new(self.mint_key(mint), ids, members[rep].id()).with_centroid(center),
            );
        }

        let mut assigned_candidates = 0;
        for face in &candidates {
            match nearest(&clusters, face.vector(), probe)? {
                Some((idx, sim)) if sim >= self.cfg.filter.candidate_min_similarity => {
                    clusters[idx].member_ids.insert(face.id());
                    assigned_candidates += 1;
                }
                _ => noise.push(face.id()),
            }
        }
        noise.sort_unstable();

        info!(
            faces = faces.len(),
            clusters = clusters.len(),
            noise = noise.len(),
            skipped,
            assigned_candidates,
            eps = params.eps,
            min_samples = params.min_samples,
            "clustering finished"
        );

        Ok(ClusteringOutcome {
            clusters,
            noise,
            skipped,
            assigned_candidates,
            params: Some(params),
        })
    }

    /// Matches one face against existing clusters without creating any.
    ///
    /// Returns the index of the closest cluster whose centroid similarity
    /// reaches the candidate bar, with that similarity. Clusters without a
    /// cached centroid are ignored.
    pub fn assign(
        &self,
        clusters: &[Cluster],
        face: &FaceEmbedding,
    ) -> Result<Option<(usize, f32)>, ClusterError> {
        let mut best: Option<(usize, f32)> = None;
        for (i, c) in clusters.iter().enumerate() {
            let Some(center) = c.centroid() else {
                continue;
            };
            let sim = cosine(center, face.vector())?;
            if best.is_none_or(|(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }
        Ok(best.filter(|&(_, sim)| sim >= self.cfg.filter.candidate_min_similarity))
    }

    /// Picks the best face among `members` against their own centroid.
    pub fn pick_representative(
        &self,
        members: &[&FaceEmbedding],
    ) -> Result<Option<ItemId>, ClusterError> {
        let vectors: Vec<&[f32]> = members.iter().map(|f| f.vector()).collect();
        let center = centroid(&vectors)?;
        let scorer = FaceScorer::new(&center, members);
        Ok(best_by_score(members, &scorer, |f| f.id()).map(|i| members[i].id()))
    }

    fn well_formed<'a>(&self, faces: &'a [FaceEmbedding]) -> (Vec<&'a FaceEmbedding>, usize) {
        let mut sorted: Vec<&FaceEmbedding> = faces.iter().collect();
        sorted.sort_by_key(|f| f.id());

        let dim = self
            .cfg
            .dim
            .or_else(|| modal_dim(sorted.iter().map(|f| &f.embedding)));
        let Some(dim) = dim else {
            return (Vec::new(), faces.len());
        };

        let mut seen = HashSet::with_capacity(sorted.len());
        let mut valid = Vec::with_capacity(sorted.len());
        let mut skipped = 0;
        for face in sorted {
            if let Err(e) = face.embedding.validate(dim) {
                debug!(item_id = face.id(), error = %e, "skipping face");
                skipped += 1;
                continue;
            }
            if !seen.insert(face.id()) {
                debug!(item_id = face.id(), "skipping duplicate face id");
                skipped += 1;
                continue;
            }
            valid.push(face);
        }
        (valid, skipped)
    }

    /// Next branch key from `mint`, e.g. "person:004".
    pub fn mint_key(&self, mint: &IdMint) -> String {
        let n = mint.next();
        if self.cfg.prefix.is_empty() {
            format!("{n:03}")
        } else {
            format!("{}:{:03}", self.cfg.prefix, n)
        }
    }
}

/// Closest cluster by centroid similarity; earlier clusters win ties.
fn nearest(
    clusters: &[Cluster],
    v: &[f32],
    probe: &mut CancelProbe,
) -> Result<Option<(usize, f32)>, ClusterError> {
    let mut best: Option<(usize, f32)> = None;
    for (i, c) in clusters.iter().enumerate() {
        probe.tick()?;
        let Some(center) = c.centroid() else {
            continue;
        };
        let sim = dot(center, v);
        if best.is_none_or(|(_, b)| sim > b) {
            best = Some((i, sim));
        }
    }
    Ok(best)
}
