use thiserror::Error;

/// Errors returned by similarity math.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimMathError {
    #[error("simmath: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("simmath: non-finite component at index {index}")]
    NonFinite { index: usize },
}
