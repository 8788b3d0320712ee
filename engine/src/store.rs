use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snapsort_cluster::Cluster;
use snapsort_simmath::{Embedding, ItemId};
use snapsort_stack::{PhotoMeta, Stack};

use crate::error::EngineError;

/// Which embedding space to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    /// One vector per detected face.
    Face,
    /// One vector per photo.
    Visual,
}

/// Detector output kept next to a face embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceMeta {
    pub photo_id: ItemId,
    pub confidence: f32,
    pub bbox_area: f32,
}

/// Read side of the embedding store.
///
/// The engine only reads through this trait and copies what it needs at job
/// start, so implementations may keep ingesting while jobs run.
pub trait EmbeddingSource: Send + Sync {
    /// Unit-norm vectors with stable ids for `scope`.
    fn get_embeddings(&self, scope: &str, kind: EmbeddingKind)
    -> Result<Vec<Embedding>, EngineError>;

    fn get_face_metadata(&self, item_id: ItemId) -> Result<Option<FaceMeta>, EngineError>;

    fn get_photo_metadata(&self, item_id: ItemId) -> Result<Option<PhotoMeta>, EngineError>;
}

/// Write side: group sets are replaced wholesale per scope.
///
/// Each call must be all-or-nothing. A failed call leaves the previous set
/// in place.
pub trait GroupSink: Send + Sync {
    fn persist_clusters(&self, scope: &str, clusters: &[Cluster]) -> Result<(), EngineError>;

    fn persist_stacks(&self, scope: &str, stacks: &[Stack]) -> Result<(), EngineError>;
}

/// In-memory [`EmbeddingSource`] and [`GroupSink`].
/// Data is lost on restart. Suitable for testing, fixtures and the CLI.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    embeddings: HashMap<(String, EmbeddingKind), Vec<Embedding>>,
    faces: HashMap<ItemId, FaceMeta>,
    photos: HashMap<ItemId, PhotoMeta>,
    clusters: HashMap<String, Vec<Cluster>>,
    stacks: HashMap<String, Vec<Stack>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a face embedding. A later face with the same id replaces the
    /// earlier one.
    pub fn add_face(&self, scope: &str, embedding: Embedding, meta: FaceMeta) {
        let mut inner = self.inner.write();
        inner.faces.insert(embedding.item_id, meta);
        upsert(
            inner
                .embeddings
                .entry((scope.to_string(), EmbeddingKind::Face))
                .or_default(),
            embedding,
        );
    }

    /// Adds a photo embedding; same replacement rule as [`Self::add_face`].
    pub fn add_photo(&self, scope: &str, embedding: Embedding, meta: PhotoMeta) {
        let mut inner = self.inner.write();
        inner.photos.insert(embedding.item_id, meta);
        upsert(
            inner
                .embeddings
                .entry((scope.to_string(), EmbeddingKind::Visual))
                .or_default(),
            embedding,
        );
    }

    /// Last persisted clusters of `scope`.
    pub fn clusters(&self, scope: &str) -> Vec<Cluster> {
        self.inner.read().clusters.get(scope).cloned().unwrap_or_default()
    }

    /// Last persisted stacks of `scope`.
    pub fn stacks(&self, scope: &str) -> Vec<Stack> {
        self.inner.read().stacks.get(scope).cloned().unwrap_or_default()
    }
}

fn upsert(list: &mut Vec<Embedding>, embedding: Embedding) {
    match list.iter_mut().find(|e| e.item_id == embedding.item_id) {
        Some(slot) => *slot = embedding,
        None => list.push(embedding),
    }
}

impl EmbeddingSource for MemoryStore {
    fn get_embeddings(
        &self,
        scope: &str,
        kind: EmbeddingKind,
    ) -> Result<Vec<Embedding>, EngineError> {
        let inner = self.inner.read();
        Ok(inner
            .embeddings
            .get(&(scope.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    fn get_face_metadata(&self, item_id: ItemId) -> Result<Option<FaceMeta>, EngineError> {
        Ok(self.inner.read().faces.get(&item_id).copied())
    }

    fn get_photo_metadata(&self, item_id: ItemId) -> Result<Option<PhotoMeta>, EngineError> {
        Ok(self.inner.read().photos.get(&item_id).cloned())
    }
}

impl GroupSink for MemoryStore {
    fn persist_clusters(&self, scope: &str, clusters: &[Cluster]) -> Result<(), EngineError> {
        self.inner
            .write()
            .clusters
            .insert(scope.to_string(), clusters.to_vec());
        Ok(())
    }

    fn persist_stacks(&self, scope: &str, stacks: &[Stack]) -> Result<(), EngineError> {
        self.inner
            .write()
            .stacks
            .insert(scope.to_string(), stacks.to_vec());
        Ok(())
    }
}
