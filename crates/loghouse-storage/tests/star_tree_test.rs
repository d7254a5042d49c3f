//! Integration tests for star-tree aggregation over ingested blocks

use std::fs;
use std::sync::{Arc, Once};

use loghouse_core::BufferPool;
use loghouse_storage::query::PqColumnTracker;
use loghouse_storage::segstats::SegStatsMap;
use loghouse_storage::startree::{
    strl_path, strm_path, AggValue, MEAS_FN_COUNT, MEAS_FN_MAX, MEAS_FN_MIN, MEAS_FN_SUM,
};
use loghouse_storage::wip::{EncodeContext, SeenColumns};
use loghouse_storage::{
    PersistentAggs, SegStore, SignalType, StarTreeBuilder, StaticQueryProvider, StoreOptions,
    WipBlock, WriterConfig, WriterEnv,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// 16 records; `f` sums to 34 and `e` is missing from three of them.
fn fixture() -> Vec<Value> {
    let mut recs = Vec::new();
    let rows: [(&str, &str, bool, &str, Option<i64>, i64); 16] = [
        ("val1", "val1", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", Some(1), 2),
        ("val2", "val3", false, "Paul", Some(1), 2),
        ("val1", "val4", true, "John", Some(1), 2),
        ("val1", "val2", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", Some(1), 2),
        ("wow", "val1", true, "John", Some(1), 4),
        ("val1", "val1", true, "John", Some(1), 2),
        ("val23", "val1", true, "John", None, 2),
        ("val1567", "val1", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", Some(1), 2),
        ("", "val1", true, "John", Some(1), 2),
        ("val1", "val1", true, "John", None, 2),
        ("val1", "val1", true, "John", None, 2),
    ];
    for (a, b, c, d, e, f) in rows {
        let mut rec = json!({"a": a, "b": b, "c": c, "d": d, "f": f});
        if let Some(e) = e {
            rec["e"] = json!(e);
        }
        recs.push(rec);
    }
    recs
}

fn encode_block(records: &[Value]) -> WipBlock {
    let mut wip = WipBlock::new(Arc::new(BufferPool::new(1024, 8)), 501);
    let tracker = PqColumnTracker::new();
    let mut seen = SeenColumns::new();
    let mut stats = SegStatsMap::new();
    for (i, rec) in records.iter().enumerate() {
        let raw = serde_json::to_vec(rec).unwrap();
        let mut ctx = EncodeContext {
            ts_key: "timestamp",
            signal: SignalType::Events,
            skip_de: false,
            pq_tracker: &tracker,
            seen: &mut seen,
            seg_stats: &mut stats,
            segment_is_empty: i == 0,
        };
        let (max_idx, _) = wip
            .encode_columns(&raw, 1_700_000_000_000 + i as u64, &mut ctx)
            .unwrap();
        wip.commit_record(max_idx);
    }
    wip
}

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn config(dir: &TempDir) -> WriterConfig {
    let root = dir.path().display();
    WriterConfig {
        data_path: format!("{}/", root),
        smr_base_dir: format!("{}/ingest/", root),
        ..Default::default()
    }
}

fn aggregating_env(config: WriterConfig) -> Arc<WriterEnv> {
    let provider = StaticQueryProvider {
        aggs: PersistentAggs {
            group_by: group_by(),
            measures: measures().into_iter().collect(),
        },
        ..Default::default()
    };
    WriterEnv::builder(config)
        .query_provider(Arc::new(provider))
        .build()
        .unwrap()
}

fn ingest(store: &mut SegStore, records: &[Value], flush_last: bool) {
    for (i, rec) in records.iter().enumerate() {
        let raw = serde_json::to_vec(rec).unwrap();
        let flush = flush_last && i + 1 == records.len();
        store
            .add_entry(&raw, 1_700_000_000_000 + i as u64, raw.len() as u64, flush, SignalType::Events)
            .unwrap();
    }
}

fn group_by() -> Vec<String> {
    vec!["a".to_string(), "d".to_string()]
}

fn measures() -> Vec<String> {
    vec!["e".to_string(), "f".to_string()]
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[test]
fn test_root_aggregates_match_fixture() {
    let wip = encode_block(&fixture());
    let mut stb = StarTreeBuilder::new();
    stb.reset_seg_tree(group_by(), measures(), 250);
    stb.compute_star_tree(&wip).unwrap();
    stb.aggregate();

    assert_eq!(stb.root_agg("f", MEAS_FN_SUM), Some(AggValue::Int(34)));
    assert_eq!(stb.root_agg("f", MEAS_FN_MIN), Some(AggValue::Int(2)));
    assert_eq!(stb.root_agg("f", MEAS_FN_MAX), Some(AggValue::Int(4)));
    assert_eq!(stb.root_agg("f", MEAS_FN_COUNT), Some(AggValue::Int(16)));
    assert_eq!(stb.root_agg("e", MEAS_FN_SUM), Some(AggValue::Int(13)));
    assert_eq!(stb.root_agg("e", MEAS_FN_COUNT), Some(AggValue::Int(13)));

    let distinct = stb.each_col_distinct_count();
    assert_eq!(distinct["a"], 6);
    assert_eq!(distinct["d"], 2);
}

#[test]
fn test_repeated_builds_are_identical() {
    let wip = encode_block(&fixture());
    let mut stb = StarTreeBuilder::new();
    let mut first: Option<Vec<AggValue>> = None;

    for _ in 0..10 {
        stb.reset_seg_tree(group_by(), measures(), 250);
        stb.compute_star_tree(&wip).unwrap();
        stb.aggregate();
        assert_eq!(stb.root_agg("f", MEAS_FN_SUM), Some(AggValue::Int(34)));

        let values = stb.root_agg_values().to_vec();
        match &first {
            Some(f) => assert_eq!(f, &values),
            None => first = Some(values),
        }
    }
}

#[test]
fn test_tree_is_cumulative_across_blocks() {
    let records = fixture();
    let (left, right) = records.split_at(8);
    let mut stb = StarTreeBuilder::new();
    stb.reset_seg_tree(group_by(), measures(), 250);
    stb.compute_star_tree(&encode_block(left)).unwrap();
    stb.compute_star_tree(&encode_block(right)).unwrap();
    stb.aggregate();

    assert_eq!(stb.root_agg("f", MEAS_FN_SUM), Some(AggValue::Int(34)));
    assert_eq!(stb.root_agg("e", MEAS_FN_COUNT), Some(AggValue::Int(13)));
}

// ---------------------------------------------------------------------------
// Segment store integration
// ---------------------------------------------------------------------------

#[test]
fn test_rotation_writes_star_tree_files() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let env = aggregating_env(config(&dir));

    let records = fixture();
    let mut store = SegStore::new(env.clone(), "s1", "logs", 0, StoreOptions::default()).unwrap();
    ingest(&mut store, &records[..8], true);
    assert!(store.is_using_star_tree());
    ingest(&mut store, &records[8..], false);
    assert!(store.is_using_star_tree());
    assert_eq!(env.star_trees.in_use(), 1);

    store.append_wip_to_segfile(true, false).unwrap();
    assert_eq!(env.star_trees.in_use(), 0);

    let meta = &env.segmeta.read_segmeta().unwrap()[0];
    assert_eq!(meta.num_blocks, 2);
    assert!(strm_path(&meta.segment_key).exists());
    assert!(strl_path(&meta.segment_key).exists());
}

/// Count aggregate of measure `f` at the root, read from `.strl`.
fn root_count_of_f(segkey: &str) -> i64 {
    let levels = fs::read(strl_path(segkey)).unwrap();
    // [level u16][numNodes u32][rootKey u32], then 9-byte slots; f is the
    // second measure and count its fourth slot
    let slot = 10 + 7 * 9;
    assert_eq!(levels[slot], 2);
    i64::from_le_bytes(levels[slot + 1..slot + 9].try_into().unwrap())
}

#[test]
fn test_failed_rename_keeps_star_tree_for_retry() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let env = aggregating_env(cfg.clone());

    let records = fixture();
    let mut store = SegStore::new(env.clone(), "s1", "logs", 0, StoreOptions::default()).unwrap();
    ingest(&mut store, &records[..8], true);

    // a file where the final directory's parent should be
    let blocker = format!("{}logs", cfg.final_base_dir());
    fs::create_dir_all(cfg.final_base_dir()).unwrap();
    fs::write(&blocker, b"x").unwrap();

    let bytes_before = store.on_disk_bytes();
    assert!(store.append_wip_to_segfile(true, false).is_err());
    assert!(store.is_using_star_tree());
    assert_eq!(env.star_trees.in_use(), 1);
    assert_eq!(store.on_disk_bytes(), bytes_before);
    assert!(!strm_path(store.segment_key()).exists());
    assert!(!strl_path(store.segment_key()).exists());

    fs::remove_file(&blocker).unwrap();
    ingest(&mut store, &records[8..], false);
    assert!(store.is_using_star_tree());
    store.append_wip_to_segfile(true, false).unwrap();
    assert_eq!(env.star_trees.in_use(), 0);

    let meta = &env.segmeta.read_segmeta().unwrap()[0];
    assert_eq!(meta.num_blocks, 2);
    assert_eq!(meta.record_count, 16);
    assert_eq!(root_count_of_f(&meta.segment_key), 16);
}

#[test]
fn test_store_without_aggregations_skips_tree() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let env = WriterEnv::new(config(&dir)).unwrap();
    let mut store = SegStore::new(env.clone(), "s1", "logs", 0, StoreOptions::default()).unwrap();
    for (i, rec) in fixture().iter().enumerate() {
        let raw = serde_json::to_vec(rec).unwrap();
        store
            .add_entry(&raw, 1_700_000_000_000 + i as u64, 0, false, SignalType::Events)
            .unwrap();
    }
    store.append_wip_to_segfile(true, false).unwrap();
    assert!(!store.is_using_star_tree());

    let meta = &env.segmeta.read_segmeta().unwrap()[0];
    assert!(!strm_path(&meta.segment_key).exists());
}
