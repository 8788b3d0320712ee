use snapsort_task::Cancelled;
use thiserror::Error;

/// Errors returned by stack generation.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack: invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("stack: {0}")]
    Cancelled(#[from] Cancelled),
}
