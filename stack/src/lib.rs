//! Similar-shot stacks.
//!
//! [`StackGroupingEngine::generate`] walks photos in capture order. Each
//! photo not yet stacked anchors a window of `time_window_secs`; photos in
//! that window from the same folder join if their cosine similarity to the
//! anchor reaches `similarity_threshold`. Groups smaller than
//! `min_stack_size` are dropped and their photos stay unstacked.
//!
//! # Generation vs. viewing
//!
//! Stacks are materialized once with fixed [`StackParams`]. A photo left out
//! at generation time is absent from the stack until the next full
//! regeneration. A viewer may hide members with a stricter runtime threshold
//! through [`StackView`], but no runtime value can show a member that was
//! not generated. Showing a looser view needs a regeneration with a lower
//! threshold.
//!
//! Regeneration replaces every stack of a scope and mints new ids; an old
//! stack id never comes back with different membership.

mod engine;
mod error;
mod photo;
mod stack;

pub use engine::{StackGroupingEngine, StackOutcome};
pub use error::StackError;
pub use photo::{PhotoMeta, PhotoScorer, QualityHints};
pub use stack::{Stack, StackParams, StackView};
