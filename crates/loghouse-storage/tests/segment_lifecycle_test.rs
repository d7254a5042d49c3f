//! Integration tests for the segment write path: flush, decode, rotate and
//! recover

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use loghouse_core::{decode_value, CValue, EncodingType};
use loghouse_storage::blocksummary::{bsu_path, read_block_summaries};
use loghouse_storage::csg::{decode_column_block, read_column_block};
use loghouse_storage::microindex::csg_path;
use loghouse_storage::segmeta::{read_sfm, sid_path};
use loghouse_storage::segstats::{decode_seg_stats, sst_path};
use loghouse_storage::timestamp::decode_timestamps;
use loghouse_storage::{
    DictBlockReader, SegMetaLog, SegStore, SignalType, StoreOptions, WriterConfig, WriterEnv,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> WriterConfig {
    let root = dir.path().display();
    WriterConfig {
        data_path: format!("{}/", root),
        smr_base_dir: format!("{}/ingest/", root),
        // small ceiling so high-cardinality columns fall back to columnar
        wip_card_limit: 4,
        star_tree_card_limit: 2,
        ..Default::default()
    }
}

fn open_store(env: &Arc<WriterEnv>) -> SegStore {
    SegStore::new(Arc::clone(env), "app-1", "logs", 0, StoreOptions::default()).unwrap()
}

fn ingest(store: &mut SegStore, raw: &str, ts: u64) {
    store
        .add_entry(raw.as_bytes(), ts, raw.len() as u64, false, SignalType::Events)
        .unwrap();
}

/// Decoded column block `cname` of block `blk`.
fn column_block(segkey: &str, cname: &str, blk: usize) -> (EncodingType, Vec<u8>, u16) {
    let summaries = read_block_summaries(&bsu_path(segkey)).unwrap();
    let (summary, bmh) = &summaries[blk];
    let offset = bmh.column_block_offset[cname];
    let len = bmh.column_block_len[cname];
    let block = read_column_block(&csg_path(segkey, cname), offset, len).unwrap();
    let (enc, payload) = decode_column_block(&block).unwrap();
    (enc, payload.into_owned(), summary.rec_count)
}

fn decode_all(mut buf: &[u8]) -> Vec<CValue> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (value, _, consumed) = decode_value(buf).unwrap();
        out.push(value);
        buf = &buf[consumed..];
    }
    out
}

// ---------------------------------------------------------------------------
// Column blocks
// ---------------------------------------------------------------------------

#[test]
fn test_flushed_block_decodes_per_encoding() {
    let dir = TempDir::new().unwrap();
    let env = WriterEnv::new(config(&dir)).unwrap();
    let mut store = open_store(&env);

    for i in 0..5u64 {
        let level = if i % 2 == 0 { "info" } else { "warn" };
        let raw = if i == 2 {
            format!(r#"{{"level":"{}","user":"u{}","latency":{},"note":"slow"}}"#, level, i, i * 10)
        } else {
            format!(r#"{{"level":"{}","user":"u{}","latency":{}}}"#, level, i, i * 10)
        };
        ingest(&mut store, &raw, 1_700_000_000_000 + i * 1000);
    }
    store.append_wip_to_segfile(false, false).unwrap();
    let segkey = store.segment_key().to_string();

    // two levels stay below the ceiling
    let (enc, payload, rec_count) = column_block(&segkey, "level", 0);
    assert_eq!(enc, EncodingType::Dictionary);
    assert_eq!(rec_count, 5);
    let mut reader = DictBlockReader::new();
    reader.read_dict_enc(&payload, rec_count).unwrap();
    assert_eq!(reader.words().len(), 2);
    let (value, _, _) = decode_value(reader.word_for_record(3).unwrap()).unwrap();
    assert_eq!(value, CValue::Str("warn".into()));

    // five users pass it
    let (enc, payload, _) = column_block(&segkey, "user", 0);
    assert_eq!(enc, EncodingType::Columnar);
    let users = decode_all(&payload);
    assert_eq!(users.len(), 5);
    assert_eq!(users[4], CValue::Str("u4".into()));

    // a column seen in one record is backfilled everywhere else
    let (enc, payload, rec_count) = column_block(&segkey, "note", 0);
    assert_eq!(enc, EncodingType::Dictionary);
    reader.read_dict_enc(&payload, rec_count).unwrap();
    for rec in 0..5u16 {
        let (value, _, _) = decode_value(reader.word_for_record(rec).unwrap()).unwrap();
        if rec == 2 {
            assert_eq!(value, CValue::Str("slow".into()));
        } else {
            assert_eq!(value, CValue::Backfill);
        }
    }

    let (enc, payload, rec_count) = column_block(&segkey, "timestamp", 0);
    assert_eq!(enc, EncodingType::TimestampTopDiffVarEnc);
    let ts = decode_timestamps(&payload, rec_count).unwrap();
    assert_eq!(ts, (0..5).map(|i| 1_700_000_000_000 + i * 1000).collect::<Vec<_>>());

    let stats = decode_seg_stats(&fs::read(sst_path(&segkey)).unwrap()).unwrap();
    assert_eq!(stats["user"].count, 5);
    assert!(!stats["user"].is_numeric);
    assert!(stats["latency"].is_numeric);
    assert_eq!(stats["note"].count, 1);
}

#[test]
fn test_dictionary_reader_does_not_leak_between_blocks() {
    let dir = TempDir::new().unwrap();
    let env = WriterEnv::new(config(&dir)).unwrap();
    let mut store = open_store(&env);

    for (i, word) in ["a", "b", "c"].iter().enumerate() {
        ingest(&mut store, &format!(r#"{{"w":"{}"}}"#, word), 1_700_000_000_000 + i as u64);
    }
    store.append_wip_to_segfile(false, false).unwrap();
    for (i, word) in ["x", "y"].iter().enumerate() {
        ingest(&mut store, &format!(r#"{{"w":"{}"}}"#, word), 1_700_000_001_000 + i as u64);
    }
    store.append_wip_to_segfile(false, false).unwrap();
    let segkey = store.segment_key().to_string();

    let mut reader = DictBlockReader::new();
    let (_, block0, recs0) = column_block(&segkey, "w", 0);
    reader.read_dict_enc(&block0, recs0).unwrap();
    assert_eq!(reader.words().len(), 3);

    let (_, block1, recs1) = column_block(&segkey, "w", 1);
    reader.read_dict_enc(&block1, recs1).unwrap();
    assert_eq!(reader.words().len(), 2);
    assert_eq!(reader.rec_to_word().len(), 2);
    let (value, _, _) = decode_value(reader.word_for_record(1).unwrap()).unwrap();
    assert_eq!(value, CValue::Str("y".into()));
}

#[test]
fn test_mixed_column_becomes_numeric_when_strings_parse() {
    let dir = TempDir::new().unwrap();
    let env = WriterEnv::new(config(&dir)).unwrap();
    let mut store = open_store(&env);
    let values = [r#"1"#, r#""2""#, r#"3.5"#, r#""4""#, r#"5"#];
    for (i, v) in values.iter().enumerate() {
        ingest(&mut store, &format!(r#"{{"size":{},"k":"k{}"}}"#, v, i), 1_700_000_000_000 + i as u64);
    }
    store.append_wip_to_segfile(false, false).unwrap();

    let (enc, payload, rec_count) = column_block(store.segment_key(), "size", 0);
    let decoded: Vec<CValue> = if enc == EncodingType::Dictionary {
        let mut reader = DictBlockReader::new();
        reader.read_dict_enc(&payload, rec_count).unwrap();
        (0..rec_count)
            .map(|r| decode_value(reader.word_for_record(r).unwrap()).unwrap().0)
            .collect()
    } else {
        decode_all(&payload)
    };
    assert_eq!(decoded.len(), 5);
    assert!(decoded.iter().all(|v| v.as_number().is_some()));
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

#[test]
fn test_rotation_moves_segment_and_logs_it() {
    let dir = TempDir::new().unwrap();
    let env = WriterEnv::new(config(&dir)).unwrap();
    let mut store = open_store(&env);
    for i in 0..3u64 {
        ingest(&mut store, &format!(r#"{{"msg":"m{}"}}"#, i), 1_700_000_000_000 + i);
    }
    let active_key = store.segment_key().to_string();
    store.append_wip_to_segfile(false, true).unwrap();

    assert!(!Path::new(&active_key).with_extension("bsu").exists());
    let metas = env.segmeta.read_segmeta().unwrap();
    assert_eq!(metas.len(), 1);
    let meta = &metas[0];
    assert_eq!(meta.record_count, 3);
    assert_eq!(meta.earliest_epoch_ms, 1_700_000_000_000);
    assert_eq!(meta.latest_epoch_ms, 1_700_000_000_002);
    assert!(bsu_path(&meta.segment_key).exists());
    assert!(sid_path(&meta.segment_key).exists());
    assert_eq!(read_sfm(&meta.segment_key).unwrap().seg_meta, *meta);

    assert_eq!(
        env.unrotated.file_name_for_rotated_segment(&active_key).as_deref(),
        Some(meta.segment_key.as_str())
    );
    assert!(store.segment_key().ends_with("/1/1"));
}

#[test]
fn test_running_metadata_recovers_interrupted_rotation() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let env = WriterEnv::new(cfg.clone()).unwrap();

    // a completed rotation to compare against
    let mut reference = SegStore::new(Arc::clone(&env), "ref", "logs", 0, StoreOptions::default()).unwrap();
    let mut crashed = SegStore::new(Arc::clone(&env), "crash", "logs", 0, StoreOptions::default()).unwrap();
    for i in 0..4u64 {
        let raw = format!(r#"{{"msg":"m{}","n":{}}}"#, i, i);
        ingest(&mut reference, &raw, 1_700_000_000_000 + i);
        ingest(&mut crashed, &raw, 1_700_000_000_000 + i);
    }
    reference.append_wip_to_segfile(true, false).unwrap();
    let expected = env.segmeta.read_segmeta().unwrap()[0].clone();

    // the crashed store flushed, then died right after its rename
    crashed.append_wip_to_segfile(false, false).unwrap();
    let final_dir = cfg.final_segment_dir("logs", "crash", crashed.suffix());
    fs::create_dir_all(Path::new(&final_dir).parent().unwrap()).unwrap();
    fs::rename(crashed.segbase_dir().trim_end_matches('/'), final_dir.trim_end_matches('/')).unwrap();

    let log = SegMetaLog::new(cfg.segmeta_path());
    let recovered = log
        .recover_unregistered(Path::new(&cfg.final_base_dir()))
        .unwrap();
    assert_eq!(recovered.len(), 1);
    let meta = &recovered[0];
    assert_eq!(meta.segment_key, format!("{}{}", final_dir, crashed.suffix()));
    assert_eq!(meta.segbase_dir, final_dir);
    assert_eq!(meta.record_count, expected.record_count);
    assert_eq!(meta.num_blocks, expected.num_blocks);
    assert_eq!(meta.earliest_epoch_ms, expected.earliest_epoch_ms);
    assert_eq!(meta.latest_epoch_ms, expected.latest_epoch_ms);
    assert_eq!(
        meta.column_names.keys().collect::<HashSet<_>>(),
        expected.column_names.keys().collect::<HashSet<_>>()
    );

    // recovery is idempotent
    assert!(log.recover_unregistered(Path::new(&cfg.final_base_dir())).unwrap().is_empty());
    assert_eq!(log.read_segmeta().unwrap().len(), 2);
}

#[test]
fn test_failed_rename_leaves_segment_active() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let env = WriterEnv::new(cfg.clone()).unwrap();
    let mut store = open_store(&env);
    ingest(&mut store, r#"{"msg":"hello"}"#, 1_700_000_000_000);
    store.append_wip_to_segfile(false, false).unwrap();

    // a file where the final directory's parent should be
    let blocker = format!("{}logs", cfg.final_base_dir());
    fs::create_dir_all(cfg.final_base_dir()).unwrap();
    fs::write(&blocker, b"x").unwrap();

    assert!(store.append_wip_to_segfile(true, false).is_err());
    assert!(store.segment_dir().exists());
    assert!(bsu_path(store.segment_key()).exists());
    assert!(env.segmeta.read_segmeta().unwrap().is_empty());
    assert_eq!(store.record_count(), 1);
}
