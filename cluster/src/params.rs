use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::face::FaceEmbedding;

/// Density parameters for one clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Maximum cosine distance (`1 - similarity`) between neighbors.
    /// Valid range: `(0, 1]`.
    pub eps: f32,

    /// Minimum neighborhood size, the point itself included. At least 2, so
    /// an isolated face never forms a cluster alone.
    pub min_samples: usize,
}

impl ClusterParams {
    pub fn new(eps: f32, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    /// Builds params from a minimum cosine similarity instead of a distance.
    pub fn from_similarity(min_similarity: f32, min_samples: usize) -> Self {
        Self::new(1.0 - min_similarity, min_samples)
    }

    /// Rejects out-of-range values. Never clamps.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if !self.eps.is_finite() || self.eps <= 0.0 || self.eps > 1.0 {
            return Err(ClusterError::InvalidParameters(format!(
                "eps must be in (0, 1], got {}",
                self.eps
            )));
        }
        if self.min_samples < 2 {
            return Err(ClusterError::InvalidParameters(format!(
                "min_samples must be at least 2, got {}",
                self.min_samples
            )));
        }
        Ok(())
    }
}

/// One row of the adaptive table: applies to corpora of at most `max_count`
/// embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTier {
    pub max_count: usize,
    pub eps: f32,
    pub min_samples: usize,
}

/// Picks density parameters from the corpus size.
///
/// Small corpora get a looser `eps` so a handful of photos of one person do
/// not fragment; large corpora get a tighter `eps` and a higher
/// `min_samples` because neighbor density rises and chains start bridging
/// different people. The last tier covers every larger count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdaptiveTable {
    tiers: Vec<AdaptiveTier>,
}

impl AdaptiveTable {
    /// Tiers must be non-empty, sorted by strictly increasing `max_count`,
    /// and each must hold valid params.
    pub fn new(tiers: Vec<AdaptiveTier>) -> Result<Self, ClusterError> {
        let table = Self { tiers };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.tiers.is_empty() {
            return Err(ClusterError::InvalidParameters(
                "adaptive table has no tiers".into(),
            ));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].max_count <= pair[0].max_count {
                return Err(ClusterError::InvalidParameters(format!(
                    "adaptive tiers out of order at max_count {}",
                    pair[1].max_count
                )));
            }
        }
        for tier in &self.tiers {
            ClusterParams::new(tier.eps, tier.min_samples).validate()?;
        }
        Ok(())
    }

    pub fn select(&self, count: usize) -> ClusterParams {
        let tier = self
            .tiers
            .iter()
            .find(|t| count <= t.max_count)
            .or_else(|| self.tiers.last());
        match tier {
            Some(t) => ClusterParams::new(t.eps, t.min_samples),
            None => ClusterParams::new(0.35, 2),
        }
    }

    pub fn tiers(&self) -> &[AdaptiveTier] {
        &self.tiers
    }
}

impl Default for AdaptiveTable {
    fn default() -> Self {
        let tier = |max_count, eps, min_samples| AdaptiveTier {
            max_count,
            eps,
            min_samples,
        };
        Self {
            tiers: vec![
                tier(50, 0.42, 2),
                tier(200, 0.38, 2),
                tier(1_000, 0.35, 3),
                tier(5_000, 0.32, 4),
                tier(usize::MAX, 0.30, 5),
            ],
        }
    }
}

/// Separates detections good enough to seed clusters from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFilter {
    /// Minimum detector confidence to seed a cluster. Default: 0.6.
    pub min_confidence: f32,

    /// Minimum bounding-box area in pixels to seed a cluster.
    /// Default: 1600 (40x40).
    pub min_bbox_area: f32,

    /// Minimum cosine similarity to a cluster centroid for a filtered-out or
    /// late face to join that cluster. Default: 0.55.
    pub candidate_min_similarity: f32,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            min_bbox_area: 1600.0,
            candidate_min_similarity: 0.55,
        }
    }
}

impl QualityFilter {
    pub fn passes(&self, face: &FaceEmbedding) -> bool {
        face.confidence >= self.min_confidence && face.bbox_area >= self.min_bbox_area
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ClusterError::InvalidParameters(format!(
                "min_confidence must be in [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !self.min_bbox_area.is_finite() || self.min_bbox_area < 0.0 {
            return Err(ClusterError::InvalidParameters(format!(
                "min_bbox_area must be non-negative, got {}",
                self.min_bbox_area
            )));
        }
        if !(-1.0..=1.0).contains(&self.candidate_min_similarity) {
            return Err(ClusterError::InvalidParameters(format!(
                "candidate_min_similarity must be in [-1, 1], got {}",
                self.candidate_min_similarity
            )));
        }
        Ok(())
    }
}

/// Clustering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Embedding dimension. When unset, the first well-formed embedding of a
    /// run fixes it and every other dimension is skipped.
    pub dim: Option<usize>,

    pub filter: QualityFilter,

    pub adaptive: AdaptiveTable,

    /// Prepended to branch keys (e.g. "person" -> "person:001").
    pub prefix: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            dim: None,
            filter: QualityFilter::default(),
            adaptive: AdaptiveTable::default(),
            prefix: "person".into(),
        }
    }
}
