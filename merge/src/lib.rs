//! Merge, split and undo for person clusters and shot stacks.
//!
//! Every operation takes the current group set by reference and returns a
//! complete replacement set. Nothing is mutated in place, so a caller can
//! apply the new set atomically or throw it away when the operation turns
//! out to be stale.
//!
//! Members are compared by underlying photo (see [`MemberIndex::photo_of`]):
//! a source member whose photo is already in the target is a duplicate and
//! is dropped rather than counted twice. [`MergeResult`] reports the exact
//! breakdown so a summary never inflates counts with duplicates.

mod error;
mod group;
mod reconciler;
mod record;

pub use error::MergeError;
pub use group::{Group, GroupSet, MemberIndex};
pub use reconciler::MergeReconciler;
pub use record::{MergeOutcome, MergeRecord, MergeResult, ReassignResult, SplitResult};
