use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use snapsort_cluster::{Cluster, ClusterError, ClusterParams};
use snapsort_engine::{
    Delivery, EmbeddingKind, EmbeddingSource, Engine, EngineConfig, EngineError, EngineEvent,
    FaceMeta, GroupSink, MemoryStore,
};
use snapsort_merge::MergeError;
use snapsort_simmath::{Embedding, ItemId};
use snapsort_stack::{PhotoMeta, QualityHints, Stack, StackParams};
use tokio::sync::oneshot;

const DIM: usize = 8;
const SCOPE: &str = "project-1";

fn vector(axis: usize, jitter_axis: usize, jitter: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis] = 1.0;
    v[jitter_axis] += jitter;
    v
}

fn add_face(store: &MemoryStore, id: ItemId, photo_id: ItemId, v: Vec<f32>) {
    store.add_face(
        SCOPE,
        Embedding::new(id, v),
        FaceMeta {
            photo_id,
            confidence: 0.9,
            bbox_area: 4000.0,
        },
    );
}

/// Eight faces of one person (ids 1..=8) and two strangers (9, 10).
fn scenario_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=8u64 {
        add_face(&store, id, 100 + id, vector(0, 1 + (id as usize % 3), 0.1));
    }
    add_face(&store, 9, 109, vector(5, 5, 0.0));
    add_face(&store, 10, 110, vector(6, 6, 0.0));
    store
}

/// Two people. Person A (faces 1-3) appears on photos 1, 2, 3; person B
/// (faces 4-6) on photos 2, 3, 4.
fn two_people_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, photo) in [(1, 1), (2, 2), (3, 3)] {
        add_face(&store, id, photo, vector(0, 2 + id as usize, 0.1));
    }
    for (id, photo) in [(4, 2), (5, 3), (6, 4)] {
        add_face(&store, id, photo, vector(1, id as usize, 0.1));
    }
    store
}

fn tight() -> Option<ClusterParams> {
    Some(ClusterParams::new(0.25, 2))
}

fn engine(store: &Arc<MemoryStore>) -> Engine {
    Engine::with_memory_store(EngineConfig::default(), Arc::clone(store)).expect("engine")
}

async fn cluster(engine: &Engine) {
    engine.request_clustering(SCOPE, tight()).unwrap();
    let deliveries = engine.run_until_idle().await;
    assert!(matches!(deliveries.last(), Some(Delivery::Applied(_))));
}

fn key_of(engine: &Engine, face: ItemId) -> String {
    engine
        .clusters(SCOPE)
        .into_iter()
        .find(|c| c.contains(face))
        .map(|c| c.branch_key)
        .expect("face is clustered")
}

#[tokio::test]
async fn test_clustering_scenario() {
    let store = scenario_store();
    let engine = engine(&store);
    let mut events = engine.subscribe();

    let token = engine.request_clustering(SCOPE, tight()).unwrap();
    let deliveries = engine.run_until_idle().await;
    assert_eq!(deliveries.len(), 1);
    assert!(matches!(&deliveries[0], Delivery::Applied(t) if *t == token));

    let clusters = engine.clusters(SCOPE);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].member_ids, (1..=8).collect::<BTreeSet<_>>());
    assert_eq!(engine.noise(SCOPE), vec![9, 10]);
    assert_eq!(store.clusters(SCOPE), clusters);

    match events.try_recv().unwrap() {
        EngineEvent::ClustersReplaced {
            generation,
            branch_keys,
            noise,
            ..
        } => {
            assert_eq!(generation, token.id);
            assert_eq!(branch_keys, vec![clusters[0].branch_key.clone()]);
            assert_eq!(noise, vec![9, 10]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_stale_clustering_is_discarded() {
    let store = scenario_store();
    let engine = engine(&store);

    // g1 would find nothing (8 faces < 9 samples); g2 finds the person.
    let g1 = engine
        .request_clustering(SCOPE, Some(ClusterParams::new(0.25, 9)))
        .unwrap();
    let g2 = engine.request_clustering(SCOPE, tight()).unwrap();
    assert!(g2.id > g1.id);

    let deliveries = engine.run_until_idle().await;
    assert_eq!(deliveries.len(), 2);
    for d in &deliveries {
        if *d.token() == g1 {
            assert!(matches!(d, Delivery::Discarded(_)));
        } else {
            assert!(matches!(d, Delivery::Applied(_)));
        }
    }
    assert_eq!(engine.applied_generations(SCOPE).0, g2.id);
    assert_eq!(engine.clusters(SCOPE).len(), 1);
}

#[tokio::test]
async fn test_invalid_override_fails_fast() {
    let store = scenario_store();
    let engine = engine(&store);
    let err = engine
        .request_clustering(SCOPE, Some(ClusterParams::new(0.0, 2)))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Cluster(ClusterError::InvalidParameters(_))
    ));
    assert_eq!(engine.in_flight(), 0);
    assert!(engine.set_override(SCOPE, Some(ClusterParams::new(0.3, 1))).is_err());
}

#[tokio::test]
async fn test_scope_override_applies() {
    let store = scenario_store();
    let engine = engine(&store);
    engine
        .set_override(SCOPE, Some(ClusterParams::new(0.25, 9)))
        .unwrap();
    engine.request_clustering(SCOPE, None).unwrap();
    engine.run_until_idle().await;
    assert!(engine.clusters(SCOPE).is_empty());
    assert_eq!(engine.noise(SCOPE).len(), 10);

    engine.set_override(SCOPE, None).unwrap();
    engine.request_clustering(SCOPE, tight()).unwrap();
    engine.run_until_idle().await;
    assert_eq!(engine.clusters(SCOPE).len(), 1);
}

#[tokio::test]
async fn test_merge_reports_duplicates_and_undoes() {
    let store = two_people_store();
    let engine = engine(&store);
    cluster(&engine).await;
    assert_eq!(engine.clusters(SCOPE).len(), 2);

    let source = key_of(&engine, 1);
    let target = key_of(&engine, 4);
    let mut events = engine.subscribe();

    let (result, record) = engine.merge(SCOPE, &target, &[source.clone()]).unwrap();
    assert_eq!(result.duplicates_found, 2);
    assert_eq!(result.unique_moved, 1);
    assert_eq!(result.moved_faces, 3);
    assert_eq!(result.total_photos, 4);

    let clusters = engine.clusters(SCOPE);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].member_ids, BTreeSet::from([1, 4, 5, 6]));
    assert_eq!(engine.noise(SCOPE), vec![2, 3]);
    assert_eq!(store.clusters(SCOPE), clusters);

    let mut saw_merge = false;
    while let Ok(ev) = events.try_recv() {
        if let EngineEvent::MergeApplied { result: r, .. } = ev {
            assert_eq!(r, result);
            saw_merge = true;
        }
    }
    assert!(saw_merge);

    engine.undo_merge(SCOPE, &record.unwrap()).unwrap();
    let clusters = engine.clusters(SCOPE);
    assert_eq!(clusters.len(), 2);
    assert_eq!(engine.clusters(SCOPE).iter().map(|c| c.len()).sum::<usize>(), 6);
    assert!(engine.noise(SCOPE).is_empty());
}

#[tokio::test]
async fn test_self_merge_and_missing_target() {
    let store = two_people_store();
    let engine = engine(&store);
    cluster(&engine).await;

    let key = key_of(&engine, 1);
    let (result, record) = engine.merge(SCOPE, &key, &[key.clone()]).unwrap();
    assert_eq!(result.moved_faces, 0);
    assert!(record.is_none());
    assert_eq!(engine.clusters(SCOPE).len(), 2);

    let err = engine.merge(SCOPE, "person:999", &[key]).unwrap_err();
    assert!(matches!(err, EngineError::Merge(MergeError::TargetNotFound(_))));
}

#[tokio::test]
async fn test_edits_do_not_survive_reclustering() {
    let store = two_people_store();
    let engine = engine(&store);
    cluster(&engine).await;

    let source = key_of(&engine, 1);
    let target = key_of(&engine, 4);
    let (_, record) = engine.merge(SCOPE, &target, &[source.clone()]).unwrap();

    // Regeneration mints fresh keys; the old ones are gone for good.
    cluster(&engine).await;
    assert!(!engine.clusters(SCOPE).iter().any(|c| c.branch_key == target || c.branch_key == source));

    let err = engine.undo_merge(SCOPE, &record.unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::Merge(MergeError::TargetNotFound(_))));
    assert_eq!(engine.clusters(SCOPE).len(), 2);
}

/// Face source whose next metadata lookup, once armed, waits until it is
/// released.
struct HeldSource {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl EmbeddingSource for HeldSource {
    fn get_embeddings(
        &self,
        scope: &str,
        kind: EmbeddingKind,
    ) -> Result<Vec<Embedding>, EngineError> {
        self.inner.get_embeddings(scope, kind)
    }

    fn get_face_metadata(&self, item_id: ItemId) -> Result<Option<FaceMeta>, EngineError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.entered.lock().take() {
                let _ = tx.send(());
            }
            let _ = self.release.lock().recv();
        }
        self.inner.get_face_metadata(item_id)
    }

    fn get_photo_metadata(&self, item_id: ItemId) -> Result<Option<PhotoMeta>, EngineError> {
        self.inner.get_photo_metadata(item_id)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_racing_a_reclustering_is_superseded() {
    let store = two_people_store();
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let source = Arc::new(HeldSource {
        inner: Arc::clone(&store),
        armed: AtomicBool::new(false),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    });
    let engine = Arc::new(
        Engine::new(EngineConfig::default(), source.clone(), store.clone()).expect("engine"),
    );
    cluster(&engine).await;
    let before: Vec<String> = engine.clusters(SCOPE).into_iter().map(|c| c.branch_key).collect();
    let (from, into) = (key_of(&engine, 1), key_of(&engine, 4));

    // The merge snapshots the current set, then stalls on its face lookups.
    source.armed.store(true, Ordering::SeqCst);
    let editor = Arc::clone(&engine);
    let edit = tokio::task::spawn_blocking(move || editor.merge(SCOPE, &into, &[from]));
    entered_rx.await.unwrap();

    let regenerated = engine.request_clustering(SCOPE, tight()).unwrap();
    let deliveries = engine.run_until_idle().await;
    assert!(matches!(deliveries.last(), Some(Delivery::Applied(t)) if *t == regenerated));
    release_tx.send(()).unwrap();

    let err = edit.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Superseded(_)));

    let clusters = engine.clusters(SCOPE);
    assert_eq!(clusters.len(), 2);
    assert!(clusters.iter().all(|c| !before.contains(&c.branch_key)));
    assert_eq!(clusters.iter().map(|c| c.len()).sum::<usize>(), 6);
    assert_eq!(engine.applied_generations(SCOPE).0, regenerated.id);
    assert_eq!(store.clusters(SCOPE), clusters);
}

/// Sink whose writes fail once `down` is set.
struct FlakySink {
    inner: Arc<MemoryStore>,
    down: AtomicBool,
}

impl GroupSink for FlakySink {
    fn persist_clusters(&self, scope: &str, clusters: &[Cluster]) -> Result<(), EngineError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::Store("disk full".into()));
        }
        self.inner.persist_clusters(scope, clusters)
    }

    fn persist_stacks(&self, scope: &str, stacks: &[Stack]) -> Result<(), EngineError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::Store("disk full".into()));
        }
        self.inner.persist_stacks(scope, stacks)
    }
}

#[tokio::test]
async fn test_failed_persist_keeps_previous_state() {
    let store = two_people_store();
    let sink = Arc::new(FlakySink {
        inner: Arc::clone(&store),
        down: AtomicBool::new(false),
    });
    let engine = Engine::new(EngineConfig::default(), store.clone(), sink.clone()).expect("engine");
    cluster(&engine).await;
    let before = engine.clusters(SCOPE);

    sink.down.store(true, Ordering::SeqCst);
    let token = engine.request_clustering(SCOPE, tight()).unwrap();
    let deliveries = engine.run_until_idle().await;
    assert!(matches!(
        deliveries.last(),
        Some(Delivery::Failed(t, EngineError::Store(_))) if *t == token
    ));
    assert_eq!(engine.clusters(SCOPE), before);
    assert_eq!(store.clusters(SCOPE), before);

    let err = engine
        .merge(SCOPE, &key_of(&engine, 4), &[key_of(&engine, 1)])
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(engine.clusters(SCOPE), before);
}

#[tokio::test]
async fn test_split_then_reassign() {
    let store = two_people_store();
    let engine = engine(&store);
    cluster(&engine).await;

    let key = key_of(&engine, 1);
    let split = engine.split(SCOPE, &key, &BTreeSet::from([3])).unwrap();
    assert_eq!(split.remaining, key);
    assert_ne!(split.created, key);
    assert_eq!(split.created_representative, 3);
    assert_eq!(engine.clusters(SCOPE).len(), 3);

    let moved = engine.reassign(SCOPE, &[3], &key).unwrap();
    assert_eq!(moved.moved, 1);
    assert_eq!(moved.removed, vec![split.created.clone()]);
    assert_eq!(engine.clusters(SCOPE).len(), 2);
    assert!(engine.clusters(SCOPE).iter().any(|c| c.branch_key == key && c.len() == 3));

    let unknown = engine.reassign(SCOPE, &[987_654], &key).unwrap();
    assert_eq!(unknown.moved, 0);
    assert_eq!(unknown.skipped, vec![987_654]);
    assert!(engine.clusters(SCOPE).iter().all(|c| !c.contains(987_654)));
}

#[tokio::test]
async fn test_assign_face_online() {
    let store = two_people_store();
    let engine = engine(&store);
    cluster(&engine).await;
    let person_a = key_of(&engine, 1);

    add_face(&store, 11, 5, vector(0, 7, 0.2));
    add_face(&store, 12, 6, vector(7, 7, 0.0));

    assert_eq!(engine.assign_face(SCOPE, 11).unwrap(), Some(person_a.clone()));
    assert_eq!(key_of(&engine, 11), person_a);
    assert_eq!(engine.assign_face(SCOPE, 12).unwrap(), None);
    assert_eq!(engine.assign_face(SCOPE, 404).unwrap(), None);
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
}

fn add_photo(store: &MemoryStore, id: ItemId, similarity: f32, secs: i64) {
    let mut v = vec![0.0; DIM];
    v[0] = similarity;
    v[id as usize] = (1.0 - similarity * similarity).max(0.0).sqrt();
    store.add_photo(
        SCOPE,
        Embedding::new(id, v),
        PhotoMeta {
            timestamp: t0() + Duration::seconds(secs),
            folder_id: 1,
            quality: QualityHints {
                sharpness: Some(0.5),
                width: 4000,
                height: 3000,
            },
        },
    );
}

/// Five burst shots two seconds apart, similarity to the first falling off.
fn burst_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (i, s) in [1.0, 0.95, 0.90, 0.80, 0.70].into_iter().enumerate() {
        add_photo(&store, i as ItemId + 1, s, 2 * i as i64);
    }
    store
}

fn burst_params() -> Option<StackParams> {
    Some(StackParams {
        similarity_threshold: 0.89,
        time_window_secs: 10,
        min_stack_size: 3,
    })
}

#[tokio::test]
async fn test_stack_regeneration_retires_old_ids() {
    let store = burst_store();
    let engine = engine(&store);
    let mut events = engine.subscribe();

    engine.request_stack_regeneration(SCOPE, burst_params()).unwrap();
    match events.try_recv().unwrap() {
        EngineEvent::StacksInvalidated { stack_ids, .. } => assert!(stack_ids.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
    engine.run_until_idle().await;

    let first = engine.stacks(SCOPE);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].member_ids, vec![1, 2, 3]);
    let old_id = first[0].stack_id;
    assert_eq!(engine.view_stack(SCOPE, old_id, 0.5), Some(vec![1, 2, 3]));

    while events.try_recv().is_ok() {}
    engine.request_stack_regeneration(SCOPE, burst_params()).unwrap();
    match events.try_recv().unwrap() {
        EngineEvent::StacksInvalidated { stack_ids, .. } => assert_eq!(stack_ids, vec![old_id]),
        other => panic!("unexpected event {other:?}"),
    }
    engine.run_until_idle().await;

    let second = engine.stacks(SCOPE);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].member_ids, first[0].member_ids);
    assert_eq!(second[0].representative_id, first[0].representative_id);
    assert_ne!(second[0].stack_id, old_id);
    assert!(engine.is_retired(SCOPE, old_id));
    assert!(engine.stack(SCOPE, old_id).is_none());
    assert_eq!(store.stacks(SCOPE), second);
}

#[tokio::test]
async fn test_stack_params_fail_fast() {
    let store = burst_store();
    let engine = engine(&store);
    let bad = StackParams {
        min_stack_size: 1,
        ..StackParams::default()
    };
    assert!(matches!(
        engine.request_stack_regeneration(SCOPE, Some(bad)),
        Err(EngineError::Stack(_))
    ));
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test]
async fn test_delete_and_merge_stacks() {
    let store = burst_store();
    // A second burst in another folder window, 60s later.
    for (id, s, secs) in [(6, 1.0, 60), (7, 0.97, 62)] {
        let mut v = vec![0.0; DIM];
        v[7] = s;
        v[6] = (1.0f32 - s * s).sqrt();
        store.add_photo(
            SCOPE,
            Embedding::new(id, v),
            PhotoMeta {
                timestamp: t0() + Duration::seconds(secs),
                folder_id: 1,
                quality: QualityHints::default(),
            },
        );
    }
    let engine = engine(&store);
    engine
        .request_stack_regeneration(
            SCOPE,
            Some(StackParams {
                similarity_threshold: 0.89,
                time_window_secs: 10,
                min_stack_size: 2,
            }),
        )
        .unwrap();
    engine.run_until_idle().await;

    let stacks = engine.stacks(SCOPE);
    assert_eq!(stacks.len(), 2);
    let (a, b) = (stacks[0].stack_id, stacks[1].stack_id);

    let (result, record) = engine.merge_stacks(SCOPE, a, &[b]).unwrap();
    assert_eq!(result.unique_moved, 2);
    assert_eq!(result.duplicates_found, 0);
    assert!(record.is_some());
    assert!(engine.is_retired(SCOPE, b));
    assert_eq!(engine.stack(SCOPE, a).unwrap().len(), 5);

    engine.undo_merge_stacks(SCOPE, record.as_ref().unwrap()).unwrap();
    assert!(!engine.is_retired(SCOPE, b));
    assert_eq!(engine.stack(SCOPE, a).unwrap().len(), 3);
    assert_eq!(engine.stack(SCOPE, b).unwrap().member_ids, vec![6, 7]);
    assert_eq!(store.stacks(SCOPE).len(), 2);

    let (_, record) = engine.merge_stacks(SCOPE, a, &[b]).unwrap();
    assert!(engine.delete_stack(SCOPE, a).unwrap());
    assert!(!engine.delete_stack(SCOPE, a).unwrap());
    assert!(engine.is_retired(SCOPE, a));
    assert!(engine.stacks(SCOPE).is_empty());
    assert!(store.stacks(SCOPE).is_empty());

    let err = engine.undo_merge_stacks(SCOPE, &record.unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::Merge(MergeError::TargetNotFound(_))));
    assert!(engine.is_retired(SCOPE, b));
}
