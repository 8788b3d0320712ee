use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapsort_simmath::{Embedding, QualityScorer};

/// Hints for picking the best shot of a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityHints {
    /// Sharpness estimate in `[0, 1]` (e.g. normalized Laplacian variance).
    pub sharpness: Option<f32>,
    pub width: u32,
    pub height: u32,
}

impl QualityHints {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Photo metadata the grouping needs: when, where, how good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMeta {
    pub timestamp: DateTime<Utc>,
    pub folder_id: u64,
    #[serde(default)]
    pub quality: QualityHints,
}

/// Sharpness first, resolution second.
///
/// Resolution is relative to the largest photo among the candidates so the
/// score stays in `[0, 1]`. A missing sharpness hint counts as 0.5.
pub struct PhotoScorer {
    max_pixels: u64,
}

impl PhotoScorer {
    const SHARPNESS_WEIGHT: f32 = 0.6;
    const RESOLUTION_WEIGHT: f32 = 0.4;

    pub fn new<'a>(members: impl IntoIterator<Item = &'a PhotoMeta>) -> Self {
        let max_pixels = members.into_iter().map(|m| m.quality.pixels()).max().unwrap_or(0);
        Self { max_pixels }
    }
}

impl QualityScorer<(&Embedding, &PhotoMeta)> for PhotoScorer {
    fn score(&self, (_, meta): &(&Embedding, &PhotoMeta)) -> f32 {
        let sharpness = meta.quality.sharpness.unwrap_or(0.5).clamp(0.0, 1.0);
        let resolution = if self.max_pixels > 0 {
            (meta.quality.pixels() as f64 / self.max_pixels as f64) as f32
        } else {
            0.0
        };
        Self::SHARPNESS_WEIGHT * sharpness + Self::RESOLUTION_WEIGHT * resolution
    }
}
