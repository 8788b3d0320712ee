use serde::{Deserialize, Serialize};
use snapsort_cluster::{AdaptiveTable, ClusterConfig, QualityFilter};
use snapsort_stack::StackParams;
use snapsort_task::CoordinatorConfig;

use crate::error::EngineError;

/// Engine configuration. Every field has a default, so an empty YAML
/// document is a valid config.
///
/// ```yaml
/// workers: 2
/// face:
///   min_confidence: 0.7
/// stacks:
///   similarity_threshold: 0.9
///   time_window_secs: 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Background jobs running at once. Default: 4.
    pub workers: usize,

    /// Comparisons between two cancellation checks. Default: 256.
    pub cancel_check_interval: usize,

    /// Face quality pre-filter and candidate acceptance bar.
    pub face: QualityFilter,

    /// Corpus-size tiers for `eps` and `min_samples`.
    pub adaptive: AdaptiveTable,

    /// Stack parameters used when a request does not carry its own.
    pub stacks: StackParams,

    /// Branch key prefix. Default: "person".
    pub face_prefix: String,

    pub face_dim: Option<usize>,
    pub visual_dim: Option<usize>,

    /// Buffered events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cancel_check_interval: 256,
            face: QualityFilter::default(),
            adaptive: AdaptiveTable::default(),
            stacks: StackParams::default(),
            face_prefix: "person".into(),
            face_dim: None,
            visual_dim: None,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, EngineError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            dim: self.face_dim,
            filter: self.face,
            adaptive: self.adaptive.clone(),
            prefix: self.face_prefix.clone(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            workers: self.workers,
            cancel_check_interval: self.cancel_check_interval,
        }
    }
}
