use thiserror::Error;

/// Errors returned by merge, split, reassignment and undo.
///
/// All of these are caller bugs: the caller must check that the groups it
/// names exist in the set it passes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("merge: target {0} not found")]
    TargetNotFound(String),

    #[error("merge: invalid split of {key}: {reason}")]
    InvalidSplit { key: String, reason: String },

    #[error("merge: cannot undo merge into {key}: {reason}")]
    UndoConflict { key: String, reason: String },
}
