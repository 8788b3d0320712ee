//! Face clustering command.

use std::sync::Arc;

use clap::Args;
use serde::{Deserialize, Serialize};
use snapsort_cluster::ClusterParams;
use snapsort_engine::{Delivery, Engine, EngineEvent, FaceMeta, MemoryStore};
use snapsort_simmath::{Embedding, ItemId};
use tracing::info;

use super::{load_engine_config, load_request, output_result, require_input_file};
use crate::Cli;

/// Cluster the faces of a fixture file into people.
#[derive(Args)]
pub struct ClusterCommand {
    /// Scope name the faces are loaded under
    #[arg(long, default_value = "default")]
    scope: String,

    /// Neighborhood radius as cosine distance (overrides the adaptive table)
    #[arg(long)]
    eps: Option<f32>,

    /// Minimum neighborhood size, used with --eps (default 2)
    #[arg(long, requires = "eps")]
    min_samples: Option<usize>,
}

/// Input fixture.
#[derive(Debug, Deserialize)]
pub struct FaceFixture {
    /// Fixed params; command-line flags win.
    #[serde(default)]
    pub params: Option<ClusterParams>,
    pub faces: Vec<FaceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FaceEntry {
    pub id: ItemId,
    /// Defaults to the face id (one face per photo).
    #[serde(default)]
    pub photo_id: Option<ItemId>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_bbox_area")]
    pub bbox_area: f32,
    pub vector: Vec<f32>,
}

fn default_confidence() -> f32 {
    1.0
}

fn default_bbox_area() -> f32 {
    10_000.0
}

#[derive(Debug, Serialize)]
struct ClusterReport {
    scope: String,
    generation: u64,
    clusters: Vec<ClusterEntry>,
    noise: Vec<ItemId>,
    skipped: usize,
}

#[derive(Debug, Serialize)]
struct ClusterEntry {
    branch_key: String,
    representative_id: ItemId,
    size: usize,
    members: Vec<ItemId>,
}

impl ClusterCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = load_engine_config(cli)?;
        let fixture: FaceFixture = load_request(require_input_file(cli)?)?;

        let params = match self.eps {
            Some(eps) => Some(ClusterParams::new(eps, self.min_samples.unwrap_or(2))),
            None => fixture.params,
        };

        let store = Arc::new(MemoryStore::new());
        let count = fixture.faces.len();
        for face in fixture.faces {
            store.add_face(
                &self.scope,
                Embedding::new(face.id, face.vector),
                FaceMeta {
                    photo_id: face.photo_id.unwrap_or(face.id),
                    confidence: face.confidence,
                    bbox_area: face.bbox_area,
                },
            );
        }
        info!(scope = %self.scope, faces = count, "fixture loaded");

        let engine = Engine::with_memory_store(cfg, store)?;
        let mut events = engine.subscribe();
        let token = engine.request_clustering(&self.scope, params)?;
        for delivery in engine.run_until_idle().await {
            if let Delivery::Failed(_, e) = delivery {
                return Err(e.into());
            }
        }

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ClustersReplaced { skipped: s, .. } = event {
                skipped = s;
            }
        }

        let report = ClusterReport {
            scope: self.scope.clone(),
            generation: token.id,
            clusters: engine
                .clusters(&self.scope)
                .into_iter()
                .map(|c| ClusterEntry {
                    branch_key: c.branch_key,
                    representative_id: c.representative_id,
                    size: c.member_ids.len(),
                    members: c.member_ids.into_iter().collect(),
                })
                .collect(),
            noise: engine.noise(&self.scope),
            skipped,
        };
        output_result(&report, cli.output.as_deref(), cli.json)
    }
}
