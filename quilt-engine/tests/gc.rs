//! Garbage collection: safe cuts, inactive-peer eviction and the
//! quota-retry path.

mod support;

use std::collections::BTreeMap;

use quilt_engine::{EngineConfig, StoreAdapter};
use quilt_types::{keys, BaselineRecord, EngineError, PeerId, SeenRecord, StoreError};
use serde_json::json;

use support::*;

#[tokio::test]
async fn gc_reclaims_a_fully_covered_shard() {
    let store = quilt_engine::MemoryStore::new();
    // a refreshes its baseline after four events; gc runs on every sync.
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_baseline_threshold(4)
            .with_gc_frequency(1),
    )
    .await;
    let b = spawn_peer(
        &store,
        "b",
        EngineConfig::default().with_baseline_threshold(1),
    )
    .await;

    for i in 1..=4 {
        a.add_todo(&format!("t{i}"), "payload").await;
    }
    // b absorbs a's events, then records once so its own baseline also
    // covers a up to 4.
    b.engine.sync().await.unwrap();
    b.add_todo("tb", "from b").await;

    let b_baseline = read_baseline(&store, "b").await.unwrap();
    assert_eq!(b_baseline.includes.get(&PeerId::new("a")), Some(&4));

    // Every baseline now covers a:4, so a's sync-triggered gc drops the
    // whole shard.
    a.engine.sync().await.unwrap();

    assert!(read_shard(&store, "a", 0).await.is_none());
    let meta = read_meta(&store, "a").await.unwrap();
    assert!(meta.shards.is_empty());
    assert_eq!(meta.last_increment, 4);
}

#[tokio::test]
async fn gc_keeps_events_beyond_the_safe_cut() {
    let store = quilt_engine::MemoryStore::new();
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_baseline_threshold(3)
            .with_gc_frequency(1),
    )
    .await;
    let b = spawn_peer(
        &store,
        "b",
        EngineConfig::default().with_baseline_threshold(1),
    )
    .await;

    // Baseline refresh lands at a:3; two more events stay uncovered.
    for i in 1..=5 {
        a.add_todo(&format!("t{i}"), "payload").await;
    }
    b.engine.sync().await.unwrap();
    // b's baseline covers a:5, but a's own still only covers a:3.
    b.add_todo("tb", "from b").await;

    a.engine.sync().await.unwrap();

    let shard = read_shard(&store, "a", 0).await.unwrap();
    let increments: Vec<u64> = shard.iter().map(|e| e.increment).collect();
    assert_eq!(increments, vec![4, 5]);
    let meta = read_meta(&store, "a").await.unwrap();
    assert_eq!(meta.shards, vec![0]);
    assert_eq!(meta.last_increment, 5);

    // Every surviving baseline still covers the cut (nothing extant
    // needs the deleted events).
    for peer in ["a", "b"] {
        let baseline = read_baseline(&store, peer).await.unwrap();
        assert!(baseline.includes.get(&PeerId::new("a")).copied().unwrap_or(0) >= 3);
    }
}

#[tokio::test]
async fn gc_without_a_safe_cut_is_a_no_op() {
    let store = quilt_engine::MemoryStore::new();
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_baseline_threshold(100)
            .with_gc_frequency(1),
    )
    .await;
    a.add_todo("t1", "one").await;

    // a's own baseline has includes {} from initialization, so the safe
    // cut is 0 and nothing may be dropped.
    a.engine.sync().await.unwrap();

    let shard = read_shard(&store, "a", 0).await.unwrap();
    assert_eq!(shard.len(), 1);
}

#[tokio::test]
async fn appends_keep_working_after_a_full_reclaim() {
    let store = quilt_engine::MemoryStore::new();
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_baseline_threshold(2)
            .with_gc_frequency(1),
    )
    .await;

    a.add_todo("t1", "one").await;
    a.add_todo("t2", "two").await;
    // Only a's own baseline exists and it covers a:2.
    a.engine.sync().await.unwrap();
    assert!(read_shard(&store, "a", 0).await.is_none());

    // The log restarts in shard 0; increments keep ascending.
    let event = a.add_todo("t3", "three").await;
    assert_eq!(event.increment, 3);
    let shard = read_shard(&store, "a", 0).await.unwrap();
    assert_eq!(shard.len(), 1);
    assert_eq!(shard[0].increment, 3);
    let meta = read_meta(&store, "a").await.unwrap();
    assert_eq!(meta.shards, vec![0]);
}

#[tokio::test]
async fn inactive_peers_are_evicted_wholesale() {
    let store = quilt_engine::MemoryStore::new();
    let day_ms = 24 * 60 * 60 * 1000u64;
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_gc_frequency(1)
            .with_inactive_eviction(60 * day_ms),
    )
    .await;

    // x went silent seventy days ago.
    let now = quilt_core::wall_clock_ms();
    seed_peer(
        &store,
        "x",
        vec![make_event(1, now - 70 * day_ms, "x1", "stale")],
        Some(BaselineRecord {
            includes: BTreeMap::from([(PeerId::new("x"), 1)]),
            state: json!({"x1": "stale"}),
        }),
        now - 70 * day_ms,
    )
    .await;

    // The sync integrates x's event first, then gc evicts the peer.
    a.engine.sync().await.unwrap();

    let x = PeerId::new("x");
    assert!(store.get(&keys::meta_key(&x)).await.unwrap().is_none());
    assert!(store.get(&keys::baseline_key(&x)).await.unwrap().is_none());
    assert!(store.get(&keys::seen_key(&x)).await.unwrap().is_none());
    assert!(store.get(&keys::shard_key(&x, 0)).await.unwrap().is_none());

    let seen = read_seen(&store, "a").await.unwrap();
    assert!(!seen.increments.contains_key(&x));
}

#[tokio::test]
async fn recently_active_peers_survive_eviction() {
    let store = quilt_engine::MemoryStore::new();
    let day_ms = 24 * 60 * 60 * 1000u64;
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_gc_frequency(1)
            .with_inactive_eviction(60 * day_ms),
    )
    .await;

    let now = quilt_core::wall_clock_ms();
    seed_peer(
        &store,
        "fresh",
        vec![make_event(1, now, "f1", "alive")],
        None,
        now - 10 * day_ms,
    )
    .await;

    a.engine.sync().await.unwrap();

    assert!(read_meta(&store, "fresh").await.is_some());
    let seen = read_seen(&store, "a").await.unwrap();
    assert_eq!(seen.increments.get(&PeerId::new("fresh")), Some(&1));
}

#[tokio::test]
async fn quota_pressure_triggers_collection_and_the_write_succeeds() {
    // Reclaiming quota can only ever free *closed* shards (the write
    // that tripped the quota replaces its own key wholesale), so the
    // events are sized to close a shard each, and baselines every two
    // events keep moving the safe cut forward. Noop events keep the
    // snapshot itself small.
    let store = quilt_engine::MemoryStore::with_quota(10_000);
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_baseline_threshold(2)
            .with_gc_frequency(1000),
    )
    .await;

    for i in 0..12 {
        a.engine
            .record("noop", json!({ "blob": "z".repeat(3000) }))
            .await
            .unwrap_or_else(|err| panic!("record {i} failed: {err}"));
    }

    // The store was kept inside its budget by collection.
    assert!(store.used_bytes() <= 10_000);
    let report = a.engine.debug_report().await.unwrap();
    assert!(
        report.event_total < 12,
        "collection never ran, {} events still stored",
        report.event_total
    );
}

#[tokio::test]
async fn a_second_quota_failure_surfaces() {
    let store = quilt_engine::MemoryStore::with_quota(400);
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default().with_baseline_threshold(100),
    )
    .await;

    // Nothing is collectable (the only baseline covers increment 0), so
    // the retry fails too and the error propagates.
    let err = a
        .engine
        .record("todo_add", todo("big", &"z".repeat(600)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Store(StoreError::QuotaExceeded)
    ));

    // The failed record consumed nothing.
    let meta = read_meta(&store, "a").await.unwrap();
    assert_eq!(meta.last_increment, 0);
}

#[tokio::test]
async fn seen_vector_is_pruned_after_eviction() {
    let store = quilt_engine::MemoryStore::new();
    let day_ms = 24 * 60 * 60 * 1000u64;
    let a = spawn_peer(
        &store,
        "a",
        EngineConfig::default()
            .with_gc_frequency(1)
            .with_inactive_eviction(60 * day_ms),
    )
    .await;

    let now = quilt_core::wall_clock_ms();
    seed_peer(
        &store,
        "x",
        vec![make_event(1, now - 70 * day_ms, "x1", "stale")],
        None,
        now - 70 * day_ms,
    )
    .await;
    // First sync integrates x and records it in the seen vector...
    a.engine.sync().await.unwrap();

    // ...and the gc pass within the same sync already rewrote it.
    let seen: SeenRecord = read_seen(&store, "a").await.unwrap();
    assert!(seen.increments.is_empty());
    assert!(seen.last_active >= now);
}
