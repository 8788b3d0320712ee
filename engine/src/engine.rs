use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use snapsort_cluster::{
    Cluster, ClusterError, ClusterParams, ClusteringEngine, ClusteringOutcome,
};
use snapsort_merge::{
    Group, GroupSet, MemberIndex, MergeError, MergeReconciler, MergeRecord, MergeResult,
    ReassignResult, SplitResult,
};
use snapsort_simmath::{IdMint, ItemId};
use snapsort_stack::{Stack, StackGroupingEngine, StackOutcome, StackParams, StackView};
use snapsort_task::{Completion, Gate, GenerationToken, JobContext, Scope, TaskCoordinator};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::snapshot::{FaceSnapshot, PhotoSnapshot};
use crate::store::{EmbeddingSource, GroupSink, MemoryStore};

enum JobOutput {
    Clusters(Result<ClusteringOutcome, EngineError>),
    Stacks(Result<StackOutcome, EngineError>),
}

/// What happened to one finished background job.
#[derive(Debug)]
pub enum Delivery {
    /// The result was current and is now the visible state.
    Applied(GenerationToken),
    /// A newer generation superseded the result; nothing changed.
    Discarded(GenerationToken),
    /// The job was current but failed; the previous state stays.
    Failed(GenerationToken, EngineError),
}

impl Delivery {
    pub fn token(&self) -> &GenerationToken {
        match self {
            Delivery::Applied(t) | Delivery::Discarded(t) | Delivery::Failed(t, _) => t,
        }
    }
}

/// Applied state of one scope.
#[derive(Default)]
struct ScopeView {
    clusters: GroupSet<Cluster>,
    noise: Vec<ItemId>,
    cluster_generation: u64,
    cluster_revision: u64,

    stacks: GroupSet<Stack>,
    stack_generation: u64,
    stack_revision: u64,
    retired_stacks: BTreeSet<u64>,
}

/// Clustering, stacking and editing for any number of scopes.
///
/// Long scans (clustering runs, stack regeneration) are spawned on the
/// coordinator's worker pool and return a [`GenerationToken`] right away.
/// Their results become visible only through [`Engine::deliver_next`], which
/// applies current results and drops superseded ones. Edits (merge, split,
/// reassignment, deletion) run inline but carry a generation too: an edit
/// computed against a group set that was replaced in the meantime is
/// discarded instead of resurrecting retired ids.
///
/// Every applied change is persisted through the [`GroupSink`] as a full
/// replacement before it becomes visible.
pub struct Engine {
    cfg: EngineConfig,
    clustering: Arc<ClusteringEngine>,
    stacking: Arc<StackGroupingEngine>,
    source: Arc<dyn EmbeddingSource>,
    sink: Arc<dyn GroupSink>,
    jobs: TaskCoordinator<JobOutput>,
    keys: Arc<IdMint>,
    stack_ids: Arc<IdMint>,
    views: RwLock<HashMap<String, ScopeView>>,
    overrides: RwLock<HashMap<String, ClusterParams>>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        source: Arc<dyn EmbeddingSource>,
        sink: Arc<dyn GroupSink>,
    ) -> Result<Self, EngineError> {
        let clustering = ClusteringEngine::new(cfg.cluster_config())?;
        cfg.stacks.validate()?;
        let stacking = match cfg.visual_dim {
            Some(dim) => StackGroupingEngine::with_dim(dim),
            None => StackGroupingEngine::new(),
        };
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        Ok(Self {
            jobs: TaskCoordinator::new(cfg.coordinator_config()),
            cfg,
            clustering: Arc::new(clustering),
            stacking: Arc::new(stacking),
            source,
            sink,
            keys: Arc::new(IdMint::new()),
            stack_ids: Arc::new(IdMint::new()),
            views: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// An engine reading from and writing to one shared [`MemoryStore`].
    pub fn with_memory_store(
        cfg: EngineConfig,
        store: Arc<MemoryStore>,
    ) -> Result<Self, EngineError> {
        Self::new(cfg, store.clone(), store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Pins clustering parameters for `scope`, or removes the pin.
    /// Per-request overrides still win.
    pub fn set_override(
        &self,
        scope: &str,
        params: Option<ClusterParams>,
    ) -> Result<(), EngineError> {
        let mut overrides = self.overrides.write();
        match params {
            Some(p) => {
                p.validate()?;
                overrides.insert(scope.to_string(), p);
            }
            None => {
                overrides.remove(scope);
            }
        }
        Ok(())
    }

    // ---- background runs ----

    /// Starts a clustering run over the scope's face embeddings.
    ///
    /// Parameters are validated here; a bad override never reaches a worker.
    /// Any run still in flight for the scope becomes stale immediately.
    pub fn request_clustering(
        &self,
        scope: &str,
        overrides: Option<ClusterParams>,
    ) -> Result<GenerationToken, EngineError> {
        if let Some(p) = &overrides {
            p.validate()?;
        }
        let params = overrides.or_else(|| self.overrides.read().get(scope).copied());

        let source = Arc::clone(&self.source);
        let engine = Arc::clone(&self.clustering);
        let keys = Arc::clone(&self.keys);
        let name = scope.to_string();
        let token = self.jobs.spawn(Scope::clustering(scope), move |ctx| {
            JobOutput::Clusters(cluster_job(&*source, &engine, &name, params, &keys, &ctx))
        });
        info!(scope, generation = token.id, "clustering requested");
        Ok(token)
    }

    /// Starts a wholesale stack regeneration.
    ///
    /// [`EngineEvent::StacksInvalidated`] goes out before the job is spawned.
    /// When the result lands, every previous stack id of the scope is retired.
    pub fn request_stack_regeneration(
        &self,
        scope: &str,
        params: Option<StackParams>,
    ) -> Result<GenerationToken, EngineError> {
        let params = params.unwrap_or(self.cfg.stacks);
        params.validate()?;

        let stack_ids = self.stack_ids(scope);
        self.emit(EngineEvent::StacksInvalidated {
            scope: scope.to_string(),
            stack_ids,
        });

        let source = Arc::clone(&self.source);
        let engine = Arc::clone(&self.stacking);
        let mint = Arc::clone(&self.stack_ids);
        let name = scope.to_string();
        let token = self.jobs.spawn(Scope::stacks(scope), move |ctx| {
            JobOutput::Stacks(stack_job(&*source, &engine, &name, params, &mint, &ctx))
        });
        info!(scope, generation = token.id, "stack regeneration requested");
        Ok(token)
    }

    /// Waits for the next finished job and applies it if still current.
    /// Returns `None` when nothing is in flight.
    pub async fn deliver_next(&self) -> Option<Delivery> {
        let gate = self.jobs.deliver_next().await?;
        Some(self.settle(gate))
    }

    /// Like [`Engine::deliver_next`] but never waits.
    pub fn try_deliver(&self) -> Option<Delivery> {
        let gate = self.jobs.try_deliver()?;
        Some(self.settle(gate))
    }

    /// Delivers until no job is in flight.
    pub async fn run_until_idle(&self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Some(d) = self.deliver_next().await {
            out.push(d);
        }
        out
    }

    fn settle(&self, gate: Gate<JobOutput>) -> Delivery {
        let (token, output) = match gate {
            Gate::Delivered(Completion { token, output }) => (token, output),
            Gate::Discarded(token) => return self.discard(token),
        };
        let applied = match output {
            JobOutput::Clusters(r) => r.and_then(|o| self.apply_clusters(&token, o)),
            JobOutput::Stacks(r) => r.and_then(|o| self.apply_stacks(&token, o)),
        };
        match applied {
            Ok(true) => Delivery::Applied(token),
            Ok(false) => self.discard(token),
            Err(e) => {
                warn!(token = %token, error = %e, "job failed");
                Delivery::Failed(token, e)
            }
        }
    }

    fn discard(&self, token: GenerationToken) -> Delivery {
        debug!(token = %token, "result discarded");
        self.emit(EngineEvent::Discarded {
            token: token.clone(),
        });
        Delivery::Discarded(token)
    }

    fn apply_clusters(
        &self,
        token: &GenerationToken,
        outcome: ClusteringOutcome,
    ) -> Result<bool, EngineError> {
        let scope = token.scope.name.as_str();
        let mut views = self.views.write();
        let view = views.entry(scope.to_string()).or_default();
        if token.id <= view.cluster_generation {
            return Ok(false);
        }

        let clusters: GroupSet<Cluster> = outcome
            .clusters
            .into_iter()
            .map(|c| (c.branch_key.clone(), c))
            .collect();
        let values: Vec<Cluster> = clusters.values().cloned().collect();
        self.sink.persist_clusters(scope, &values)?;

        view.clusters = clusters;
        view.noise = outcome.noise;
        view.cluster_generation = token.id;
        view.cluster_revision += 1;
        let event = EngineEvent::ClustersReplaced {
            scope: scope.to_string(),
            generation: token.id,
            branch_keys: view.clusters.keys().cloned().collect(),
            noise: view.noise.clone(),
            skipped: outcome.skipped,
        };
        drop(views);

        info!(
            scope,
            generation = token.id,
            skipped = outcome.skipped,
            candidates = outcome.assigned_candidates,
            "clusters applied"
        );
        self.emit(event);
        Ok(true)
    }

    fn apply_stacks(
        &self,
        token: &GenerationToken,
        outcome: StackOutcome,
    ) -> Result<bool, EngineError> {
        let scope = token.scope.name.as_str();
        let mut views = self.views.write();
        let view = views.entry(scope.to_string()).or_default();
        if token.id <= view.stack_generation {
            return Ok(false);
        }

        self.sink.persist_stacks(scope, &outcome.stacks)?;

        let retired: Vec<u64> = view.stacks.keys().copied().collect();
        view.retired_stacks.extend(retired);
        view.stacks = outcome.stacks.into_iter().map(|s| (s.stack_id, s)).collect();
        view.stack_generation = token.id;
        view.stack_revision += 1;
        let event = EngineEvent::StacksReplaced {
            scope: scope.to_string(),
            generation: token.id,
            stack_ids: view.stacks.keys().copied().collect(),
            skipped: outcome.skipped,
        };
        drop(views);

        info!(scope, generation = token.id, skipped = outcome.skipped, "stacks applied");
        self.emit(event);
        Ok(true)
    }

    // ---- edits ----

    /// Folds `sources` into `target`, dropping members whose photo the
    /// target already has. The result always carries the exact
    /// duplicate/unique breakdown.
    pub fn merge(
        &self,
        scope: &str,
        target: &str,
        sources: &[String],
    ) -> Result<(MergeResult, Option<MergeRecord<Cluster>>), EngineError> {
        let target = target.to_string();
        let (result, record) = self.edit::<Cluster, _>(scope, |groups, index| {
            let out = MergeReconciler::new(index).merge(groups, &target, sources)?;
            Ok((out.groups, (out.result, out.record)))
        })?;
        if let Some(r) = &record {
            self.emit(EngineEvent::MergeApplied {
                scope: scope.to_string(),
                target: target.clone(),
                sources: r.sources.clone(),
                result,
            });
        }
        Ok((result, record))
    }

    /// Reverts a cluster merge if nothing touched the groups involved since.
    pub fn undo_merge(
        &self,
        scope: &str,
        record: &MergeRecord<Cluster>,
    ) -> Result<(), EngineError> {
        self.edit::<Cluster, _>(scope, |groups, index| {
            Ok((MergeReconciler::new(index).undo(groups, record)?, ()))
        })?;
        self.emit(EngineEvent::MergeUndone {
            scope: scope.to_string(),
            target: record.target.clone(),
        });
        Ok(())
    }

    /// Moves `subset` of `key` into a new cluster under a fresh branch key.
    pub fn split(
        &self,
        scope: &str,
        key: &str,
        subset: &BTreeSet<ItemId>,
    ) -> Result<SplitResult<String>, EngineError> {
        let key = key.to_string();
        let new_key = self.clustering.mint_key(&self.keys);
        self.edit::<Cluster, _>(scope, |groups, index| {
            Ok(MergeReconciler::new(index).split(groups, &key, subset, new_key)?)
        })
    }

    /// Moves faces into `target` by hand. Clusters left empty are deleted.
    pub fn reassign(
        &self,
        scope: &str,
        ids: &[ItemId],
        target: &str,
    ) -> Result<ReassignResult<String>, EngineError> {
        let target = target.to_string();
        self.edit::<Cluster, _>(scope, |groups, index| {
            Ok(MergeReconciler::new(index).reassign(groups, ids, &target)?)
        })
    }

    /// Matches a face that is in no cluster against the current centroids.
    /// It joins the closest cluster only if it clears the candidate bar;
    /// no cluster is ever created here.
    pub fn assign_face(&self, scope: &str, face_id: ItemId) -> Result<Option<String>, EngineError> {
        let mut clusters = self.clusters(scope);
        if let Some(c) = clusters.iter().find(|c| c.contains(face_id)) {
            return Ok(Some(c.branch_key.clone()));
        }

        let snapshot = FaceSnapshot::load(&*self.source, scope)?;
        let Some(face) = snapshot.faces.iter().find(|f| f.id() == face_id) else {
            return Ok(None);
        };
        let index = snapshot.index(&self.clustering);
        for c in clusters.iter_mut().filter(|c| c.centroid().is_none()) {
            c.refresh_centroid(|id| index.vector(id))
                .map_err(ClusterError::from)?;
        }
        let Some((i, similarity)) = self.clustering.assign(&clusters, face)? else {
            debug!(scope, face_id, "face stays unassigned");
            return Ok(None);
        };

        let key = clusters[i].branch_key.clone();
        self.reassign(scope, &[face_id], &key)?;
        info!(scope, face_id, branch_key = %key, similarity, "face assigned");
        Ok(Some(key))
    }

    /// Folds source stacks into `target`. Source ids are retired.
    pub fn merge_stacks(
        &self,
        scope: &str,
        target: u64,
        sources: &[u64],
    ) -> Result<(MergeResult, Option<MergeRecord<Stack>>), EngineError> {
        let (result, record) = self.edit::<Stack, _>(scope, |groups, index| {
            let out = MergeReconciler::new(index).merge(groups, &target, sources)?;
            Ok((out.groups, (out.result, out.record)))
        })?;
        if let Some(r) = &record {
            self.emit(EngineEvent::MergeApplied {
                scope: scope.to_string(),
                target: target.to_string(),
                sources: r.sources.iter().map(u64::to_string).collect(),
                result,
            });
        }
        Ok((result, record))
    }

    /// Reverts a stack merge. The restored source ids are live again; a
    /// record from before a regeneration fails with `TargetNotFound`.
    pub fn undo_merge_stacks(
        &self,
        scope: &str,
        record: &MergeRecord<Stack>,
    ) -> Result<(), EngineError> {
        self.edit::<Stack, _>(scope, |groups, index| {
            Ok((MergeReconciler::new(index).undo(groups, record)?, ()))
        })?;
        self.emit(EngineEvent::MergeUndone {
            scope: scope.to_string(),
            target: record.target.to_string(),
        });
        Ok(())
    }

    /// Deletes one stack and retires its id. Returns false when the id is
    /// not a live stack of the scope.
    pub fn delete_stack(&self, scope: &str, stack_id: u64) -> Result<bool, EngineError> {
        self.edit::<Stack, _>(scope, |groups, _| {
            let mut next = groups.clone();
            let existed = next.remove(&stack_id).is_some();
            Ok((next, existed))
        })
    }

    /// Runs `op` against a snapshot of the scope's groups under a merge
    /// generation and applies the returned set if the groups did not change
    /// in the meantime.
    fn edit<G, R>(
        &self,
        scope: &str,
        op: impl FnOnce(&GroupSet<G>, &dyn MemberIndex) -> Result<(GroupSet<G>, R), MergeError>,
    ) -> Result<R, EngineError>
    where
        G: Managed,
    {
        let (base, revision) = {
            let views = self.views.read();
            views
                .get(scope)
                .map(|v| (G::groups(v).clone(), G::revision(v)))
                .unwrap_or_default()
        };

        let gate = self.jobs.run_inline(Scope::merge(scope), |_: &JobContext| {
            G::with_index(self, scope, |index| op(&base, index))
        });
        let (token, output) = match gate {
            Gate::Delivered(c) => (c.token, c.output),
            Gate::Discarded(token) => {
                self.discard(token.clone());
                return Err(EngineError::Superseded(token));
            }
        };
        let (next, r) = output??;

        let mut views = self.views.write();
        let view = views.entry(scope.to_string()).or_default();
        if G::revision(view) != revision {
            drop(views);
            self.discard(token.clone());
            return Err(EngineError::Superseded(token));
        }
        let event = G::commit(view, next, &*self.sink, scope)?;
        drop(views);

        debug!(token = %token, "edit applied");
        self.emit(event);
        Ok(r)
    }

    // ---- reads ----

    /// Applied clusters of `scope`, ordered by branch key.
    pub fn clusters(&self, scope: &str) -> Vec<Cluster> {
        self.views
            .read()
            .get(scope)
            .map(|v| v.clusters.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Faces of the applied partition that belong to no cluster.
    pub fn noise(&self, scope: &str) -> Vec<ItemId> {
        self.views
            .read()
            .get(scope)
            .map(|v| v.noise.clone())
            .unwrap_or_default()
    }

    /// Applied stacks of `scope`, ordered by id.
    pub fn stacks(&self, scope: &str) -> Vec<Stack> {
        self.views
            .read()
            .get(scope)
            .map(|v| v.stacks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stack(&self, scope: &str, stack_id: u64) -> Option<Stack> {
        self.views.read().get(scope)?.stacks.get(&stack_id).cloned()
    }

    /// Members of a stack visible at `runtime_threshold`. Never more than
    /// were stored at generation time.
    pub fn view_stack(
        &self,
        scope: &str,
        stack_id: u64,
        runtime_threshold: f32,
    ) -> Option<Vec<ItemId>> {
        self.stack(scope, stack_id)
            .map(|s| StackView::new(runtime_threshold).filter(&s))
    }

    /// True once a stack id has been replaced or deleted.
    pub fn is_retired(&self, scope: &str, stack_id: u64) -> bool {
        self.views
            .read()
            .get(scope)
            .is_some_and(|v| v.retired_stacks.contains(&stack_id))
    }

    /// Generation of the applied clustering and stack sets.
    pub fn applied_generations(&self, scope: &str) -> (u64, u64) {
        self.views
            .read()
            .get(scope)
            .map_or((0, 0), |v| (v.cluster_generation, v.stack_generation))
    }

    /// Jobs whose result has not been delivered yet.
    pub fn in_flight(&self) -> usize {
        self.jobs.in_flight()
    }

    fn stack_ids(&self, scope: &str) -> Vec<u64> {
        self.views
            .read()
            .get(scope)
            .map(|v| v.stacks.keys().copied().collect())
            .unwrap_or_default()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn cluster_job(
    source: &dyn EmbeddingSource,
    engine: &ClusteringEngine,
    scope: &str,
    params: Option<ClusterParams>,
    keys: &IdMint,
    ctx: &JobContext,
) -> Result<ClusteringOutcome, EngineError> {
    let snapshot = FaceSnapshot::load(source, scope)?;
    let mut probe = ctx.probe();
    let mut outcome = engine.run(&snapshot.faces, params, keys, &mut probe)?;
    outcome.skipped += snapshot.missing_meta;
    Ok(outcome)
}

fn stack_job(
    source: &dyn EmbeddingSource,
    engine: &StackGroupingEngine,
    scope: &str,
    params: StackParams,
    mint: &IdMint,
    ctx: &JobContext,
) -> Result<StackOutcome, EngineError> {
    let snapshot = PhotoSnapshot::load(source, scope)?;
    let mut probe = ctx.probe();
    Ok(engine.generate(&snapshot.photos, &snapshot.meta, params, mint, &mut probe)?)
}

/// Group kinds the engine keeps per scope.
trait Managed: Group {
    fn groups(view: &ScopeView) -> &GroupSet<Self>;

    fn revision(view: &ScopeView) -> u64;

    fn with_index<R>(
        engine: &Engine,
        scope: &str,
        f: impl FnOnce(&dyn MemberIndex) -> R,
    ) -> Result<R, EngineError>;

    /// Persists `next` and makes it the scope's visible set.
    fn commit(
        view: &mut ScopeView,
        next: GroupSet<Self>,
        sink: &dyn GroupSink,
        scope: &str,
    ) -> Result<EngineEvent, EngineError>;
}

impl Managed for Cluster {
    fn groups(view: &ScopeView) -> &GroupSet<Self> {
        &view.clusters
    }

    fn revision(view: &ScopeView) -> u64 {
        view.cluster_revision
    }

    fn with_index<R>(
        engine: &Engine,
        scope: &str,
        f: impl FnOnce(&dyn MemberIndex) -> R,
    ) -> Result<R, EngineError> {
        let snapshot = FaceSnapshot::load(&*engine.source, scope)?;
        let index = snapshot.index(&engine.clustering);
        Ok(f(&index))
    }

    /// Faces that fell out of every cluster (merge duplicates, undo) join
    /// the noise list; faces that entered one leave it.
    fn commit(
        view: &mut ScopeView,
        next: GroupSet<Self>,
        sink: &dyn GroupSink,
        scope: &str,
    ) -> Result<EngineEvent, EngineError> {
        let values: Vec<Cluster> = next.values().cloned().collect();
        sink.persist_clusters(scope, &values)?;

        let clustered: BTreeSet<ItemId> =
            next.values().flat_map(|c| c.member_ids.iter().copied()).collect();
        let noise: BTreeSet<ItemId> = view
            .clusters
            .values()
            .flat_map(|c| c.member_ids.iter().copied())
            .chain(view.noise.iter().copied())
            .filter(|id| !clustered.contains(id))
            .collect();

        view.clusters = next;
        view.noise = noise.into_iter().collect();
        view.cluster_revision += 1;
        Ok(EngineEvent::ClustersReplaced {
            scope: scope.to_string(),
            generation: view.cluster_generation,
            branch_keys: view.clusters.keys().cloned().collect(),
            noise: view.noise.clone(),
            skipped: 0,
        })
    }
}

impl Managed for Stack {
    fn groups(view: &ScopeView) -> &GroupSet<Self> {
        &view.stacks
    }

    fn revision(view: &ScopeView) -> u64 {
        view.stack_revision
    }

    fn with_index<R>(
        engine: &Engine,
        scope: &str,
        f: impl FnOnce(&dyn MemberIndex) -> R,
    ) -> Result<R, EngineError> {
        let snapshot = PhotoSnapshot::load(&*engine.source, scope)?;
        Ok(f(&snapshot.index()))
    }

    /// Ids that disappear from the set are retired. Ids that come back
    /// through an undo are live again.
    fn commit(
        view: &mut ScopeView,
        next: GroupSet<Self>,
        sink: &dyn GroupSink,
        scope: &str,
    ) -> Result<EngineEvent, EngineError> {
        let values: Vec<Stack> = next.values().cloned().collect();
        sink.persist_stacks(scope, &values)?;

        let gone: Vec<u64> = view
            .stacks
            .keys()
            .filter(|id| !next.contains_key(id))
            .copied()
            .collect();
        view.retired_stacks.extend(gone);
        for id in next.keys() {
            view.retired_stacks.remove(id);
        }
        view.stacks = next;
        view.stack_revision += 1;
        Ok(EngineEvent::StacksReplaced {
            scope: scope.to_string(),
            generation: view.stack_generation,
            stack_ids: view.stacks.keys().copied().collect(),
            skipped: 0,
        })
    }
}
