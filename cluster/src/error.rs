use snapsort_simmath::SimMathError;
use snapsort_task::Cancelled;
use thiserror::Error;

/// Errors returned by clustering.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster: invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("cluster: {0}")]
    Math(#[from] SimMathError),

    #[error("cluster: {0}")]
    Cancelled(#[from] Cancelled),
}
