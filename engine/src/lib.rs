//! The engine facade: background clustering and stacking behind generation
//! gates, inline edits, and the store interfaces it reads from and writes to.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! // ... store.add_face(...) ...
//! let engine = Engine::with_memory_store(EngineConfig::default(), store)?;
//! let token = engine.request_clustering("project-1", None)?;
//! while let Some(delivery) = engine.deliver_next().await {
//!     // Applied, Discarded (superseded) or Failed
//! }
//! let people = engine.clusters("project-1");
//! ```
//!
//! Results reach the visible state only through [`Engine::deliver_next`].
//! Subscribers of [`Engine::subscribe`] hear about every replacement, and
//! about stack ids that are about to be retired.

mod config;
mod engine;
mod error;
mod event;
mod snapshot;
mod store;

pub use config::EngineConfig;
pub use engine::{Delivery, Engine};
pub use error::EngineError;
pub use event::EngineEvent;
pub use store::{EmbeddingKind, EmbeddingSource, FaceMeta, GroupSink, MemoryStore};
