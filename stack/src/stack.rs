use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snapsort_simmath::ItemId;

use crate::error::StackError;

/// Parameters a stack set was generated with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackParams {
    /// Minimum cosine similarity to the anchor photo. Valid range: `(0, 1]`.
    pub similarity_threshold: f32,

    /// Forward scan window from the anchor's capture time, in seconds.
    pub time_window_secs: u64,

    /// Smallest group persisted as a stack. At least 2.
    pub min_stack_size: usize,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            time_window_secs: 10,
            min_stack_size: 2,
        }
    }
}

impl StackParams {
    /// Rejects out-of-range values. Never clamps.
    pub fn validate(&self) -> Result<(), StackError> {
        let t = self.similarity_threshold;
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(StackError::InvalidParameters(format!(
                "similarity_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.min_stack_size < 2 {
            return Err(StackError::InvalidParameters(format!(
                "min_stack_size must be at least 2, got {}",
                self.min_stack_size
            )));
        }
        Ok(())
    }
}

/// A group of near-duplicate or burst shots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Minted at generation; never reused for other membership.
    pub stack_id: u64,

    /// Members in capture order. The representative is always included.
    pub member_ids: Vec<ItemId>,

    pub representative_id: ItemId,

    /// Cosine similarity of each member to the representative at generation
    /// time, floored at 0. The representative scores 1.
    pub similarity_scores: BTreeMap<ItemId, f32>,

    pub generation_params: StackParams,
}

impl Stack {
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.member_ids.contains(&id)
    }

    pub fn score_of(&self, id: ItemId) -> Option<f32> {
        self.similarity_scores.get(&id).copied()
    }
}

/// Runtime filter over a generated stack.
///
/// Filtering is a monotone subset of the stored members: a lower runtime
/// threshold shows at least as many members as a higher one, and no value
/// shows a photo that was excluded at generation time. The representative is
/// always shown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackView {
    pub runtime_threshold: f32,
}

impl StackView {
    pub fn new(runtime_threshold: f32) -> Self {
        Self { runtime_threshold }
    }

    /// Visible members in capture order.
    pub fn filter(&self, stack: &Stack) -> Vec<ItemId> {
        stack
            .member_ids
            .iter()
            .copied()
            .filter(|&id| {
                id == stack.representative_id
                    || stack
                        .score_of(id)
                        .is_some_and(|s| s >= self.runtime_threshold)
            })
            .collect()
    }

    /// True when the viewer asks for more than was generated. The view then
    /// shows every stored member and nothing more; callers should say so
    /// instead of implying the looser threshold took effect.
    pub fn exceeds_generation(&self, stack: &Stack) -> bool {
        self.runtime_threshold < stack.generation_params.similarity_threshold
    }
}
