//! Similarity math over unit-normalized embedding vectors.
//!
//! Every vector that enters the engine is L2-normalized once at ingestion
//! ([`Embedding::new`]), so cosine similarity reduces to a plain dot product.
//! [`dot`] does not re-check the norm; passing unnormalized vectors produces
//! a meaningless result.
//!
//! ```
//! use snapsort_simmath::{Embedding, cosine, centroid};
//!
//! let a = Embedding::new(1, vec![3.0, 4.0]);
//! let b = Embedding::new(2, vec![4.0, 3.0]);
//! let sim = cosine(&a.vector, &b.vector).unwrap();
//! assert!((sim - 0.96).abs() < 1e-6);
//!
//! let c = centroid(&[a.vector.as_slice(), b.vector.as_slice()]).unwrap();
//! assert_eq!(c.len(), 2);
//! ```

mod cosine;
mod embedding;
mod error;
mod ids;
mod score;

pub use cosine::{centroid, cosine, cosine_distance, dot, l2_normalize};
pub use embedding::{Embedding, ItemId, modal_dim};
pub use error::SimMathError;
pub use ids::IdMint;
pub use score::{QualityScorer, best_by_score};
