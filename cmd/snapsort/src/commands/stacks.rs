//! Similar-shot stacking command.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use snapsort_engine::{Delivery, Engine, EngineEvent, MemoryStore};
use snapsort_simmath::{Embedding, ItemId};
use snapsort_stack::{PhotoMeta, QualityHints, StackParams, StackView};
use tracing::{info, warn};

use super::{load_engine_config, load_request, output_result, require_input_file};
use crate::Cli;

/// Group the photos of a fixture file into similar-shot stacks.
#[derive(Args)]
pub struct StacksCommand {
    /// Scope name the photos are loaded under
    #[arg(long, default_value = "default")]
    scope: String,

    /// Minimum cosine similarity to the anchor photo
    #[arg(long)]
    threshold: Option<f32>,

    /// Forward scan window in seconds
    #[arg(long)]
    window: Option<u64>,

    /// Smallest group kept as a stack
    #[arg(long)]
    min_size: Option<usize>,

    /// Runtime view threshold; lists the members visible at that value
    #[arg(long)]
    view: Option<f32>,
}

/// Input fixture.
#[derive(Debug, Deserialize)]
pub struct PhotoFixture {
    /// Generation params; command-line flags override single fields.
    #[serde(default)]
    pub params: Option<StackParams>,
    pub photos: Vec<PhotoEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PhotoEntry {
    pub id: ItemId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub folder_id: u64,
    #[serde(default)]
    pub sharpness: Option<f32>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct StackReport {
    scope: String,
    generation: u64,
    params: StackParams,
    stacks: Vec<StackEntry>,
    unstacked: Vec<ItemId>,
    skipped: usize,
}

#[derive(Debug, Serialize)]
struct StackEntry {
    stack_id: u64,
    representative_id: ItemId,
    members: Vec<ItemId>,
    scores: BTreeMap<ItemId, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    visible: Option<Vec<ItemId>>,
}

impl StacksCommand {
    fn params(&self, base: StackParams) -> StackParams {
        StackParams {
            similarity_threshold: self.threshold.unwrap_or(base.similarity_threshold),
            time_window_secs: self.window.unwrap_or(base.time_window_secs),
            min_stack_size: self.min_size.unwrap_or(base.min_stack_size),
        }
    }

    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let cfg = load_engine_config(cli)?;
        let fixture: PhotoFixture = load_request(require_input_file(cli)?)?;
        let params = self.params(fixture.params.unwrap_or(cfg.stacks));

        let store = Arc::new(MemoryStore::new());
        let ids: BTreeSet<ItemId> = fixture.photos.iter().map(|p| p.id).collect();
        for photo in fixture.photos {
            store.add_photo(
                &self.scope,
                Embedding::new(photo.id, photo.vector),
                PhotoMeta {
                    timestamp: photo.timestamp,
                    folder_id: photo.folder_id,
                    quality: QualityHints {
                        sharpness: photo.sharpness,
                        width: photo.width,
                        height: photo.height,
                    },
                },
            );
        }
        info!(scope = %self.scope, photos = ids.len(), "fixture loaded");

        let engine = Engine::with_memory_store(cfg, store)?;
        let mut events = engine.subscribe();
        let token = engine.request_stack_regeneration(&self.scope, Some(params))?;
        for delivery in engine.run_until_idle().await {
            if let Delivery::Failed(_, e) = delivery {
                return Err(e.into());
            }
        }

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::StacksReplaced { skipped: s, .. } = event {
                skipped = s;
            }
        }

        let view = self.view.map(StackView::new);
        let stacks = engine.stacks(&self.scope);
        if let Some(v) = view
            && stacks.iter().any(|s| v.exceeds_generation(s))
        {
            warn!(
                view = v.runtime_threshold,
                generation = params.similarity_threshold,
                "view threshold is looser than generation; showing stored members only"
            );
        }

        let stacked: BTreeSet<ItemId> =
            stacks.iter().flat_map(|s| s.member_ids.iter().copied()).collect();
        let report = StackReport {
            scope: self.scope.clone(),
            generation: token.id,
            params,
            unstacked: ids.difference(&stacked).copied().collect(),
            stacks: stacks
                .into_iter()
                .map(|s| StackEntry {
                    visible: view.map(|v| v.filter(&s)),
                    stack_id: s.stack_id,
                    representative_id: s.representative_id,
                    members: s.member_ids,
                    scores: s.similarity_scores,
                })
                .collect(),
            skipped,
        };
        output_result(&report, cli.output.as_deref(), cli.json)
    }
}
