use serde::{Deserialize, Serialize};
use snapsort_simmath::{Embedding, ItemId, QualityScorer, dot};

/// A detected face: its embedding plus the detection metadata that feeds the
/// quality pre-filter and representative selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub embedding: Embedding,

    /// Photo the face was cropped from. Merges compare members by this
    /// identity, not by face id.
    pub photo_id: ItemId,

    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,

    /// Bounding-box area in pixels.
    pub bbox_area: f32,
}

impl FaceEmbedding {
    pub fn id(&self) -> ItemId {
        self.embedding.item_id
    }

    pub fn vector(&self) -> &[f32] {
        &self.embedding.vector
    }
}

/// Composite face quality: closeness to the cluster centroid, detector
/// confidence and relative box size.
pub struct FaceScorer<'a> {
    centroid: &'a [f32],
    max_area: f32,
}

impl<'a> FaceScorer<'a> {
    const CLOSENESS_WEIGHT: f32 = 0.5;
    const CONFIDENCE_WEIGHT: f32 = 0.3;
    const SIZE_WEIGHT: f32 = 0.2;

    /// `centroid` must have the members' dimension.
    pub fn new(centroid: &'a [f32], members: &[&FaceEmbedding]) -> Self {
        let max_area = members
            .iter()
            .map(|f| f.bbox_area)
            .filter(|a| a.is_finite())
            .fold(0.0f32, f32::max);
        Self { centroid, max_area }
    }
}

impl QualityScorer<&FaceEmbedding> for FaceScorer<'_> {
    fn score(&self, face: &&FaceEmbedding) -> f32 {
        let closeness = if self.centroid.len() == face.vector().len() {
            dot(self.centroid, face.vector()).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let size = if self.max_area > 0.0 {
            (face.bbox_area / self.max_area).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self::CLOSENESS_WEIGHT * closeness
            + Self::CONFIDENCE_WEIGHT * face.confidence.clamp(0.0, 1.0)
            + Self::SIZE_WEIGHT * size
    }
}

#[cfg(test)]
mod tests {
    use snapsort_simmath::best_by_score;

    use super::*;

    fn face(id: ItemId, v: Vec<f32>, confidence: f32, area: f32) -> FaceEmbedding {
        FaceEmbedding {
            embedding: Embedding::new(id, v),
            photo_id: id,
            confidence,
            bbox_area: area,
        }
    }

    #[test]
    fn prefers_central_confident_large() {
        let a = face(1, vec![1.0, 0.0], 0.9, 10_000.0);
        let b = face(2, vec![0.8, 0.6], 0.9, 10_000.0);
        let c = face(3, vec![1.0, 0.0], 0.5, 2_000.0);
        let members = [&a, &b, &c];
        let centroid = [1.0, 0.0];
        let scorer = FaceScorer::new(&centroid, &members);
        assert!(scorer.score(&&a) > scorer.score(&&b));
        assert!(scorer.score(&&a) > scorer.score(&&c));
        assert_eq!(best_by_score(&members, &scorer, |f| f.id()), Some(0));
    }

    #[test]
    fn tie_goes_to_lowest_id() {
        let a = face(5, vec![1.0, 0.0], 0.9, 100.0);
        let b = face(2, vec![1.0, 0.0], 0.9, 100.0);
        let members = [&a, &b];
        let centroid = [1.0, 0.0];
        let scorer = FaceScorer::new(&centroid, &members);
        assert_eq!(best_by_score(&members, &scorer, |f| f.id()), Some(1));
    }
}
