use std::collections::{BTreeMap, HashMap, HashSet};

use snapsort_simmath::{Embedding, IdMint, ItemId, best_by_score, dot, modal_dim};
use snapsort_task::CancelProbe;
use tracing::{debug, info};

use crate::error::StackError;
use crate::photo::{PhotoMeta, PhotoScorer};
use crate::stack::{Stack, StackParams};

/// Result of one stack generation.
#[derive(Debug, Clone)]
pub struct StackOutcome {
    /// Stacks in capture order of their anchors.
    pub stacks: Vec<Stack>,

    /// Well-formed photos that are in no stack, ascending.
    pub unstacked: Vec<ItemId>,

    /// Photos left out for a bad embedding, missing metadata or a repeated id.
    pub skipped: usize,

    pub params: StackParams,
}

impl StackOutcome {
    pub fn stack_of(&self, id: ItemId) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.contains(id))
    }
}

/// Groups photos into similar-shot stacks.
#[derive(Debug, Clone, Default)]
pub struct StackGroupingEngine {
    dim: Option<usize>,
}

impl StackGroupingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the embedding dimension instead of taking it from the first
    /// well-formed photo.
    pub fn with_dim(dim: usize) -> Self {
        Self { dim: Some(dim) }
    }

    /// Builds the complete stack partition for one scope.
    ///
    /// `meta` is a snapshot taken before the job started. Output depends
    /// only on the input set and `params`, not on slice order: photos are
    /// walked by `(timestamp, id)`.
    pub fn generate(
        &self,
        photos: &[Embedding],
        meta: &HashMap<ItemId, PhotoMeta>,
        params: StackParams,
        mint: &IdMint,
        probe: &mut CancelProbe,
    ) -> Result<StackOutcome, StackError> {
        params.validate()?;

        let (ordered, skipped) = self.well_formed(photos, meta);
        let window_ms = i64::try_from(params.time_window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);

        let n = ordered.len();
        let mut stacked = vec![false; n];
        let mut stacks = Vec::new();

        for i in 0..n {
            if stacked[i] {
                continue;
            }
            let (anchor, anchor_meta) = ordered[i];
            let mut group = vec![i];

            for j in (i + 1)..n {
                let (candidate, candidate_meta) = ordered[j];
                let elapsed = (candidate_meta.timestamp - anchor_meta.timestamp).num_milliseconds();
                if elapsed > window_ms {
                    break;
                }
                if stacked[j] || candidate_meta.folder_id != anchor_meta.folder_id {
                    continue;
                }
                probe.tick()?;
                if dot(&anchor.vector, &candidate.vector) >= params.similarity_threshold {
                    group.push(j);
                }
            }

            if group.len() < params.min_stack_size {
                continue;
            }
            for &g in &group {
                stacked[g] = true;
            }
            let members: Vec<(&Embedding, &PhotoMeta)> = group.iter().map(|&g| ordered[g]).collect();
            stacks.push(build_stack(&members, params, mint));
        }

        let mut unstacked: Vec<ItemId> = ordered
            .iter()
            .zip(stacked.iter())
            .filter(|(_, s)| !**s)
            .map(|((e, _), _)| e.item_id)
            .collect();
        unstacked.sort_unstable();

        info!(
            photos = photos.len(),
            stacks = stacks.len(),
            unstacked = unstacked.len(),
            skipped,
            threshold = params.similarity_threshold,
            window_secs = params.time_window_secs,
            min_size = params.min_stack_size,
            "stack generation finished"
        );

        Ok(StackOutcome {
            stacks,
            unstacked,
            skipped,
            params,
        })
    }

    fn well_formed<'a>(
        &self,
        photos: &'a [Embedding],
        meta: &'a HashMap<ItemId, PhotoMeta>,
    ) -> (Vec<(&'a Embedding, &'a PhotoMeta)>, usize) {
        let mut by_id: Vec<&Embedding> = photos.iter().collect();
        by_id.sort_by_key(|e| e.item_id);

        let dim = self.dim.or_else(|| modal_dim(by_id.iter().copied()));
        let Some(dim) = dim else {
            return (Vec::new(), photos.len());
        };

        let mut seen = HashSet::with_capacity(by_id.len());
        let mut out = Vec::with_capacity(by_id.len());
        let mut skipped = 0;
        for e in by_id {
            if let Err(err) = e.validate(dim) {
                debug!(item_id = e.item_id, error = %err, "skipping photo");
                skipped += 1;
                continue;
            }
            let Some(m) = meta.get(&e.item_id) else {
                debug!(item_id = e.item_id, "skipping photo without metadata");
                skipped += 1;
                continue;
            };
            if !seen.insert(e.item_id) {
                debug!(item_id = e.item_id, "skipping duplicate photo id");
                skipped += 1;
                continue;
            }
            out.push((e, m));
        }
        out.sort_by(|a, b| {
            a.1.timestamp
                .cmp(&b.1.timestamp)
                .then(a.0.item_id.cmp(&b.0.item_id))
        });
        (out, skipped)
    }
}

fn build_stack(members: &[(&Embedding, &PhotoMeta)], params: StackParams, mint: &IdMint) -> Stack {
    let scorer = PhotoScorer::new(members.iter().map(|(_, m)| *m));
    let rep_idx = best_by_score(members, &scorer, |(e, _)| e.item_id).unwrap_or(0);
    let rep = members[rep_idx].0;

    let similarity_scores: BTreeMap<ItemId, f32> = members
        .iter()
        .map(|(e, _)| {
            let score = if e.item_id == rep.item_id {
                1.0
            } else {
                dot(&rep.vector, &e.vector).clamp(0.0, 1.0)
            };
            (e.item_id, score)
        })
        .collect();

    Stack {
        stack_id: mint.next(),
        member_ids: members.iter().map(|(e, _)| e.item_id).collect(),
        representative_id: rep.item_id,
        similarity_scores,
        generation_params: params,
    }
}
