//! Write path guarantees: FIFO application, full drain on shutdown, and
//! retention that spares hibernated assets.

use std::collections::BTreeMap;
use std::sync::Arc;

use collision_engine::archive::{ArchiveOutcome, PatternArchive, PatternFilter};
use collision_engine::config::{EngineConfig, DAY_MS};
use collision_engine::metrics::EngineStats;
use collision_engine::reliability::writer::{spawn_writer, WriteQueue, WriterConfig, WriterHandle};
use collision_engine::storage::{fetch_page, open_reader, PageQuery, PatternStore};
use collision_engine::types::{Category, Pattern};

const NOW: u64 = 1_700_000_000_000;

fn setup(dir: &tempfile::TempDir) -> (EngineConfig, PatternArchive, WriteQueue, WriterHandle, Arc<EngineStats>) {
    let cfg = EngineConfig {
        sqlite_path: dir.path().join("durable.sqlite").to_string_lossy().to_string(),
        ..Default::default()
    };
    let stats = Arc::new(EngineStats::new());
    let store = PatternStore::open(&cfg.sqlite_path).unwrap();
    let wcfg = WriterConfig {
        capacity: cfg.queue_capacity,
        watermark: cfg.backlog_watermark,
        retry: cfg.retry_config(),
    };
    let (queue, writer) = spawn_writer(store, wcfg, stats.clone()).unwrap();
    let archive = PatternArchive::new(&cfg, queue.clone(), stats.clone()).unwrap();
    (cfg, archive, queue, writer, stats)
}

fn pattern(id: &str, asset: &str, created_at: u64) -> Pattern {
    Pattern {
        id: id.to_string(),
        producer_id: "disc-X-market".to_string(),
        asset: Some(asset.to_string()),
        value: 90.0,
        features: BTreeMap::new(),
        category: Category::Market,
        signal_type: "market_linear".to_string(),
        created_at,
    }
}

#[tokio::test]
async fn test_tasks_applied_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, archive, _queue, writer, _stats) = setup(&dir);
    for id in ["A", "B", "C"] {
        assert_eq!(archive.archive(pattern(id, "X", NOW), NOW).unwrap(), ArchiveOutcome::Accepted);
    }
    writer.shutdown().await.unwrap();

    let reader = open_reader(&cfg.sqlite_path).unwrap();
    let page = fetch_page(&reader, &PageQuery::default(), 0, 10).unwrap();
    let ids: Vec<&str> = page.iter().map(|p| p.pattern.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
    assert!(page.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn test_shutdown_drains_every_accepted_write() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, archive, _queue, writer, stats) = setup(&dir);
    for i in 0..500 {
        archive.archive(pattern(&format!("p{}", i), "X", NOW), NOW).unwrap();
    }
    writer.shutdown().await.unwrap();

    let store = PatternStore::open(&cfg.sqlite_path).unwrap();
    assert_eq!(store.pattern_count().unwrap(), 500);
    let snap = stats.snapshot();
    assert_eq!(snap.writes_applied, 500);
    assert_eq!(snap.writes_dropped, 0);
}

#[tokio::test]
async fn test_retention_spares_hibernated_assets() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, archive, queue, writer, _stats) = setup(&dir);
    let old = NOW - 91 * DAY_MS;
    archive.archive(pattern("old-x", "X", old), old).unwrap();
    archive.archive(pattern("old-h", "H", old), old).unwrap();
    archive.archive(pattern("new-x", "X", NOW), NOW).unwrap();
    archive.retain_asset("H").unwrap();

    // Reads go through a separate connection, so wait for the writer first.
    queue.sync().await.unwrap();
    assert_eq!(archive.query(&PatternFilter::default(), NOW).count(), 3);
    let removed = archive.sweep_retention(NOW).unwrap();
    assert_eq!(removed, 1);
    writer.shutdown().await.unwrap();

    let store = PatternStore::open(&cfg.sqlite_path).unwrap();
    assert!(store.get_pattern("old-x").unwrap().is_none());
    let kept = store.get_pattern("old-h").unwrap().unwrap();
    assert!(kept.retained);
    assert!(store.get_pattern("new-x").unwrap().is_some());
}
