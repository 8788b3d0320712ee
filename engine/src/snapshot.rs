use std::collections::HashMap;

use snapsort_cluster::{ClusteringEngine, FaceEmbedding};
use snapsort_merge::MemberIndex;
use snapsort_simmath::{Embedding, ItemId, best_by_score, dot};
use snapsort_stack::{PhotoMeta, PhotoScorer};
use tracing::warn;

use crate::error::EngineError;
use crate::store::{EmbeddingKind, EmbeddingSource};

/// Faces of one scope, copied out of the store when a job starts.
pub(crate) struct FaceSnapshot {
    pub faces: Vec<FaceEmbedding>,

    /// Embeddings without detector metadata. Counted as skipped.
    pub missing_meta: usize,
}

impl FaceSnapshot {
    pub fn load(source: &dyn EmbeddingSource, scope: &str) -> Result<Self, EngineError> {
        let embeddings = source.get_embeddings(scope, EmbeddingKind::Face)?;
        let mut faces = Vec::with_capacity(embeddings.len());
        let mut missing_meta = 0;
        for embedding in embeddings {
            match source.get_face_metadata(embedding.item_id)? {
                Some(meta) => faces.push(FaceEmbedding {
                    embedding,
                    photo_id: meta.photo_id,
                    confidence: meta.confidence,
                    bbox_area: meta.bbox_area,
                }),
                None => missing_meta += 1,
            }
        }
        Ok(Self {
            faces,
            missing_meta,
        })
    }

    pub fn index<'a>(&'a self, engine: &'a ClusteringEngine) -> FaceIndex<'a> {
        FaceIndex {
            engine,
            faces: self.faces.iter().map(|f| (f.id(), f)).collect(),
        }
    }
}

/// Photos of one scope with their metadata.
pub(crate) struct PhotoSnapshot {
    pub photos: Vec<Embedding>,
    pub meta: HashMap<ItemId, PhotoMeta>,
}

impl PhotoSnapshot {
    pub fn load(source: &dyn EmbeddingSource, scope: &str) -> Result<Self, EngineError> {
        let photos = source.get_embeddings(scope, EmbeddingKind::Visual)?;
        let mut meta = HashMap::with_capacity(photos.len());
        for photo in &photos {
            if let Some(m) = source.get_photo_metadata(photo.item_id)? {
                meta.insert(photo.item_id, m);
            }
        }
        Ok(Self { photos, meta })
    }

    pub fn index(&self) -> PhotoIndex<'_> {
        PhotoIndex {
            photos: self.photos.iter().map(|p| (p.item_id, p)).collect(),
            meta: &self.meta,
        }
    }
}

/// Face lookups for cluster edits.
pub(crate) struct FaceIndex<'a> {
    engine: &'a ClusteringEngine,
    faces: HashMap<ItemId, &'a FaceEmbedding>,
}

impl FaceIndex<'_> {
    pub fn vector(&self, id: ItemId) -> Option<&[f32]> {
        self.faces.get(&id).map(|f| f.vector())
    }
}

impl MemberIndex for FaceIndex<'_> {
    fn photo_of(&self, id: ItemId) -> ItemId {
        self.faces.get(&id).map_or(id, |f| f.photo_id)
    }

    fn pick_representative(&self, members: &[ItemId]) -> Option<ItemId> {
        let known: Vec<&FaceEmbedding> =
            members.iter().filter_map(|id| self.faces.get(id).copied()).collect();
        if known.is_empty() {
            return None;
        }
        match self.engine.pick_representative(&known) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "representative pick failed");
                None
            }
        }
    }

    fn similarity(&self, a: ItemId, b: ItemId) -> Option<f32> {
        let (a, b) = (self.vector(a)?, self.vector(b)?);
        (a.len() == b.len()).then(|| dot(a, b))
    }

    fn knows(&self, id: ItemId) -> bool {
        self.faces.contains_key(&id)
    }
}

/// Photo lookups for stack edits.
pub(crate) struct PhotoIndex<'a> {
    photos: HashMap<ItemId, &'a Embedding>,
    meta: &'a HashMap<ItemId, PhotoMeta>,
}

impl MemberIndex for PhotoIndex<'_> {
    fn photo_of(&self, id: ItemId) -> ItemId {
        id
    }

    fn pick_representative(&self, members: &[ItemId]) -> Option<ItemId> {
        let pairs: Vec<(&Embedding, &PhotoMeta)> = members
            .iter()
            .filter_map(|id| Some((*self.photos.get(id)?, self.meta.get(id)?)))
            .collect();
        let scorer = PhotoScorer::new(pairs.iter().map(|(_, m)| *m));
        best_by_score(&pairs, &scorer, |(e, _)| e.item_id).map(|i| pairs[i].0.item_id)
    }

    fn similarity(&self, a: ItemId, b: ItemId) -> Option<f32> {
        let (a, b) = (self.photos.get(&a)?, self.photos.get(&b)?);
        (a.dim() == b.dim()).then(|| dot(&a.vector, &b.vector))
    }

    fn knows(&self, id: ItemId) -> bool {
        self.photos.contains_key(&id)
    }
}
