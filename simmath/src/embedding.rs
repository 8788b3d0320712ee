use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cosine::l2_normalize;
use crate::error::SimMathError;

/// Stable identifier of an embedded item (a face crop or a photo).
pub type ItemId = u64;

/// A unit-normalized feature vector keyed by item id.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub item_id: ItemId,

    /// L2-normalized vector.
    pub vector: Vec<f32>,

    /// Norm of the raw vector before normalization.
    pub norm: f64,
}

impl Embedding {
    /// Normalizes `raw` and wraps it.
    pub fn new(item_id: ItemId, mut raw: Vec<f32>) -> Self {
        let norm = l2_normalize(&mut raw);
        Self {
            item_id,
            vector: raw,
            norm,
        }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    /// Checks that the vector has dimension `dim`, is finite and non-zero.
    /// Batch scans call this per item and skip failures instead of aborting.
    pub fn validate(&self, dim: usize) -> Result<(), SimMathError> {
        if self.vector.len() != dim {
            return Err(SimMathError::DimensionMismatch {
                expected: dim,
                got: self.vector.len(),
            });
        }
        if let Some(index) = self.vector.iter().position(|x| !x.is_finite()) {
            return Err(SimMathError::NonFinite { index });
        }
        if self.norm == 0.0 || !self.norm.is_finite() {
            return Err(SimMathError::NonFinite { index: 0 });
        }
        Ok(())
    }
}

/// The most common dimension among usable embeddings. Ties go to the
/// dimension of the lowest item id. `None` when nothing is usable.
pub fn modal_dim<'a>(items: impl IntoIterator<Item = &'a Embedding>) -> Option<usize> {
    // dim -> (count, lowest id)
    let mut tally: BTreeMap<usize, (usize, ItemId)> = BTreeMap::new();
    for e in items {
        if e.validate(e.dim()).is_err() {
            continue;
        }
        let entry = tally.entry(e.dim()).or_insert((0, e.item_id));
        entry.0 += 1;
        entry.1 = entry.1.min(e.item_id);
    }
    tally
        .into_iter()
        .max_by_key(|&(_, (count, lowest))| (count, Reverse(lowest)))
        .map(|(dim, _)| dim)
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("item_id", &self.item_id)
            .field("dim", &self.vector.len())
            .field("norm", &self.norm)
            .finish()
    }
}
