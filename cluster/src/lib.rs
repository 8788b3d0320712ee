//! Person clustering over face embeddings.
//!
//! [`ClusteringEngine::run`] partitions a snapshot of face embeddings with
//! DBSCAN on cosine distance. Faces that never reach a dense neighborhood
//! stay unassigned instead of being forced into the nearest cluster, which
//! would merge different people.
//!
//! `eps` and `min_samples` come from an [`AdaptiveTable`] keyed on corpus
//! size unless the caller passes explicit [`ClusterParams`]. Low-quality
//! detections never seed a cluster; after the density pass they may join an
//! existing cluster through a separate, lower similarity bar.
//!
//! # Usage
//!
//! ```ignore
//! let engine = ClusteringEngine::new(ClusterConfig::default())?;
//! let outcome = engine.run(&faces, None, &mint, &mut CancelProbe::never())?;
//! for c in &outcome.clusters {
//!     println!("{} -> {} faces", c.branch_key, c.len());
//! }
//! ```

mod cluster;
mod dbscan;
mod engine;
mod error;
mod face;
mod params;

pub use cluster::Cluster;
pub use engine::{ClusteringEngine, ClusteringOutcome};
pub use error::ClusterError;
pub use face::{FaceEmbedding, FaceScorer};
pub use params::{AdaptiveTable, AdaptiveTier, ClusterConfig, ClusterParams, QualityFilter};
