use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hitrank_adapters::{DisabledDescriber, FixtureUpstream, TemplateDescriber};
use hitrank_core::{LooseInt, RecordPatch};
use hitrank_storage::{MemoryRecordStore, RecordStore};
use hitrank_sync::{Engine, EngineError};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/hits_single_season.json")
}

fn engine_over(store: &MemoryRecordStore) -> Engine {
    Engine::new(Arc::new(store.clone()), Arc::new(TemplateDescriber))
}

async fn snapshot(store: &MemoryRecordStore) -> BTreeMap<i64, (i32, i32, i32)> {
    store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.id, (r.year, r.hits, r.rank)))
        .collect()
}

#[tokio::test]
async fn reconciling_the_same_batch_twice_is_additive_only() {
    let store = MemoryRecordStore::new();
    let engine = engine_over(&store);
    let upstream = FixtureUpstream::new(fixture_path());

    let first = engine.reconcile_from(&upstream).await.unwrap();
    assert_eq!(first.inserted, 12);
    let after_first = snapshot(&store).await;

    let second = engine.reconcile_from(&upstream).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 12);
    assert_eq!(snapshot(&store).await, after_first);
}

#[tokio::test]
async fn fixture_ranks_are_competition_ranks_per_year() {
    let store = MemoryRecordStore::new();
    engine_over(&store)
        .reconcile_from(&FixtureUpstream::new(fixture_path()))
        .await
        .unwrap();

    let rows = snapshot(&store).await;
    // 1930: Terry 254, Klein 250, Herman 241
    assert_eq!(rows[&4].2, 1);
    assert_eq!(rows[&7].2, 2);
    assert_eq!(rows[&10].2, 3);
    // 1922: Hornsby 250, Sisler 246
    assert_eq!(rows[&6].2, 1);
    assert_eq!(rows[&9].2, 2);
    // single-entry years rank first
    assert_eq!(rows[&1].2, 1);
}

#[tokio::test]
async fn upstream_failure_writes_nothing() {
    let store = MemoryRecordStore::new();
    let err = engine_over(&store)
        .reconcile_from(&FixtureUpstream::new("/does/not/exist.json"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::UpstreamFetch(_)));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn generator_outage_during_reconcile_leaves_descriptions_empty() {
    let store = MemoryRecordStore::new();
    let engine = Engine::new(Arc::new(store.clone()), Arc::new(DisabledDescriber));
    let summary = engine
        .reconcile_from(&FixtureUpstream::new(fixture_path()))
        .await
        .unwrap();

    assert_eq!(summary.inserted, 12);
    assert_eq!(summary.description_failures, 12);
    let records = store.list_all().await.unwrap();
    assert!(records.iter().all(|r| r.description.is_none()));
}

#[tokio::test]
async fn edit_then_recalculate_keeps_ranks_consistent() {
    let store = MemoryRecordStore::new();
    let engine = engine_over(&store);
    engine
        .reconcile_from(&FixtureUpstream::new(fixture_path()))
        .await
        .unwrap();

    // Babe Herman (1930, 241) catches Bill Terry (1930, 254).
    let patch = RecordPatch {
        hits: Some(LooseInt::Text("254".into())),
        ..Default::default()
    };
    let edited = engine.edit_record(10, &patch).await.unwrap();
    assert_eq!(edited.rank, 1);

    let rows = snapshot(&store).await;
    assert_eq!(rows[&4].2, 1);
    assert_eq!(rows[&10].2, 1);
    assert_eq!(rows[&7].2, 3);

    let again = engine.recalculate_ranks(1930).await.unwrap();
    assert_eq!(again.changed, 0);
    assert_eq!(snapshot(&store).await, rows);
}
