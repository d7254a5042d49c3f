//! Unrotated Segment Info
//!
//! Segments that are still being written are visible to queries only
//! through this registry. After every block flush the store records the
//! block summary, where each column block landed, the columns seen so far
//! and the persistent-query matches of the block. On rotation the entry is
//! dropped and the active key is remembered, together with its final key,
//! in the recently-rotated map so readers that raced the rename can find
//! the files.
//!
//! ## Lifecycle
//!
//! ```text
//! flush block ──► update_block_info(active_key)
//!      ...
//! rotate     ──► mark_rotated(active_key, final_key) ──► recently rotated
//!                                                         │
//!                                   prune_recently_rotated (after 60s)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::blocksummary::{BlockMetadataHolder, BlockSummary};
use crate::pqmr::RecordBitmap;
use crate::wip::WipBlock;

/// How long a rotated segment stays in the recently-rotated map.
pub const RECENTLY_ROTATED_TTL: Duration = Duration::from_secs(60);

/// Query-visible state of one active segment.
#[derive(Debug, Clone, Default)]
pub struct UnrotatedSegmentInfo {
    pub table_name: String,
    pub org_id: u64,
    pub record_count: u64,
    pub earliest_ms: u64,
    pub latest_ms: u64,
    pub block_summaries: Vec<BlockSummary>,
    pub block_info: BTreeMap<u16, BlockMetadataHolder>,
    pub all_columns: BTreeSet<String>,
    /// pqid -> block -> matched records
    pub pq_results: HashMap<String, BTreeMap<u16, RecordBitmap>>,
    /// Bytes of micro-index data written for this segment
    pub cmi_size: u64,
}

/// Everything a flush reports about the block it just wrote.
pub struct BlockFlushInfo<'a> {
    pub segkey: &'a str,
    pub table_name: &'a str,
    pub org_id: u64,
    pub blk_num: u16,
    pub wip: &'a WipBlock,
    pub block_meta: BlockMetadataHolder,
    pub all_columns: &'a BTreeSet<String>,
    pub earliest_ms: u64,
    pub latest_ms: u64,
    pub record_count: u64,
    pub metadata_size: u64,
}

#[derive(Debug, Clone)]
struct RecentlyRotated {
    final_key: String,
    rotated_at: Instant,
}

#[derive(Debug, Default)]
pub struct UnrotatedRegistry {
    segments: RwLock<HashMap<String, UnrotatedSegmentInfo>>,
    recently_rotated: RwLock<HashMap<String, RecentlyRotated>>,
}

impl UnrotatedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_block_info(&self, info: BlockFlushInfo<'_>) {
        let mut segments = self.segments.write();
        let entry = segments
            .entry(info.segkey.to_string())
            .or_insert_with(|| UnrotatedSegmentInfo {
                table_name: info.table_name.to_string(),
                org_id: info.org_id,
                ..Default::default()
            });

        entry.block_summaries.push(*info.wip.summary());
        entry.block_info.insert(info.blk_num, info.block_meta);
        entry.earliest_ms = info.earliest_ms;
        entry.latest_ms = info.latest_ms;
        entry.record_count = info.record_count;
        entry.cmi_size += info.metadata_size;
        entry.all_columns.extend(info.all_columns.iter().cloned());

        for (pqid, bitmap) in &info.wip.pq_matches {
            entry
                .pq_results
                .entry(pqid.clone())
                .or_default()
                .insert(info.blk_num, bitmap.clone());
        }
    }

    pub fn remove(&self, segkey: &str) -> Option<UnrotatedSegmentInfo> {
        self.segments.write().remove(segkey)
    }

    /// Move `segkey` from the unrotated registry to the recently-rotated map.
    pub fn mark_rotated(&self, segkey: &str, final_key: &str) {
        self.recently_rotated.write().insert(
            segkey.to_string(),
            RecentlyRotated {
                final_key: final_key.to_string(),
                rotated_at: Instant::now(),
            },
        );
        self.remove(segkey);
    }

    pub fn is_unrotated(&self, segkey: &str) -> bool {
        self.segments.read().contains_key(segkey)
    }

    pub fn is_recently_rotated(&self, segkey: &str) -> bool {
        self.recently_rotated.read().contains_key(segkey)
    }

    /// Final key of a segment rotated within the retention window.
    pub fn file_name_for_rotated_segment(&self, segkey: &str) -> Option<String> {
        self.recently_rotated
            .read()
            .get(segkey)
            .map(|r| r.final_key.clone())
    }

    pub fn columns(&self, segkey: &str) -> Option<BTreeSet<String>> {
        self.segments.read().get(segkey).map(|s| s.all_columns.clone())
    }

    pub fn block_search_info(&self, segkey: &str) -> Option<BTreeMap<u16, BlockMetadataHolder>> {
        self.segments.read().get(segkey).map(|s| s.block_info.clone())
    }

    pub fn block_summaries(&self, segkey: &str) -> Option<Vec<BlockSummary>> {
        self.segments
            .read()
            .get(segkey)
            .map(|s| s.block_summaries.clone())
    }

    pub fn has_pqid_results(&self, segkey: &str, pqid: &str) -> bool {
        self.segments
            .read()
            .get(segkey)
            .and_then(|s| s.pq_results.get(pqid))
            .is_some_and(|blocks| blocks.values().any(RecordBitmap::any))
    }

    /// Active segments of `tables` owned by `org_id` that overlap
    /// `[start_ms, end_ms]`, with their time ranges.
    pub fn filter_segments(
        &self,
        start_ms: u64,
        end_ms: u64,
        tables: &[&str],
        org_id: u64,
    ) -> HashMap<String, (u64, u64)> {
        self.segments
            .read()
            .iter()
            .filter(|(_, s)| s.org_id == org_id && tables.contains(&s.table_name.as_str()))
            .filter(|(_, s)| s.earliest_ms <= end_ms && s.latest_ms >= start_ms)
            .map(|(k, s)| (k.clone(), (s.earliest_ms, s.latest_ms)))
            .collect()
    }

    /// Number of active segments and records held in them.
    pub fn totals(&self) -> (usize, u64) {
        let segments = self.segments.read();
        let records = segments.values().map(|s| s.record_count).sum();
        (segments.len(), records)
    }

    /// Drop recently-rotated entries older than `max_age`.
    pub fn prune_recently_rotated(&self, max_age: Duration) -> usize {
        let mut rotated = self.recently_rotated.write();
        let before = rotated.len();
        rotated.retain(|_, r| r.rotated_at.elapsed() <= max_age);
        let pruned = before - rotated.len();
        if pruned > 0 {
            tracing::trace!(pruned, remaining = rotated.len(), "Pruned recently rotated segments");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PqColumnTracker;
    use crate::segstats::SegStatsMap;
    use crate::wip::{EncodeContext, SeenColumns, SignalType};
    use loghouse_core::BufferPool;
    use std::sync::Arc;

    fn one_record_block() -> WipBlock {
        let mut wip = WipBlock::new(Arc::new(BufferPool::new(1024, 4)), 501);
        let tracker = PqColumnTracker::new();
        let mut seen = SeenColumns::new();
        let mut stats = SegStatsMap::new();
        let mut ctx = EncodeContext {
            ts_key: "timestamp",
            signal: SignalType::Events,
            skip_de: false,
            pq_tracker: &tracker,
            seen: &mut seen,
            seg_stats: &mut stats,
            segment_is_empty: true,
        };
        let (max_idx, _) = wip
            .encode_columns(br#"{"host":"web-1"}"#, 1_700_000_000_000, &mut ctx)
            .unwrap();
        wip.commit_record(max_idx);
        wip.ensure_pq_match("pq1", 8);
        wip.pq_matches.get_mut("pq1").unwrap().add_matched_record(0);
        wip
    }

    fn flush_info<'a>(wip: &'a WipBlock, cols: &'a BTreeSet<String>, blk_num: u16) -> BlockFlushInfo<'a> {
        BlockFlushInfo {
            segkey: "active/t/s/0/0",
            table_name: "t",
            org_id: 0,
            blk_num,
            wip,
            block_meta: BlockMetadataHolder::new(blk_num),
            all_columns: cols,
            earliest_ms: 1_700_000_000_000,
            latest_ms: 1_700_000_000_000,
            record_count: blk_num as u64 + 1,
            metadata_size: 10,
        }
    }

    #[test]
    fn test_block_info_accumulates() {
        let registry = UnrotatedRegistry::new();
        let wip = one_record_block();
        let cols: BTreeSet<String> = ["host".to_string()].into_iter().collect();

        registry.update_block_info(flush_info(&wip, &cols, 0));
        registry.update_block_info(flush_info(&wip, &cols, 1));

        assert!(registry.is_unrotated("active/t/s/0/0"));
        assert_eq!(registry.block_summaries("active/t/s/0/0").unwrap().len(), 2);
        assert_eq!(registry.block_search_info("active/t/s/0/0").unwrap().len(), 2);
        assert!(registry.columns("active/t/s/0/0").unwrap().contains("host"));
        assert!(registry.has_pqid_results("active/t/s/0/0", "pq1"));
        assert!(!registry.has_pqid_results("active/t/s/0/0", "pq2"));
        assert_eq!(registry.totals(), (1, 2));

        let hits = registry.filter_segments(0, u64::MAX, &["t"], 0);
        assert_eq!(hits.len(), 1);
        assert!(registry.filter_segments(0, 10, &["t"], 0).is_empty());
        assert!(registry.filter_segments(0, u64::MAX, &["other"], 0).is_empty());
    }

    #[test]
    fn test_rotation_moves_to_recently_rotated() {
        let registry = UnrotatedRegistry::new();
        let wip = one_record_block();
        let cols = BTreeSet::new();
        registry.update_block_info(flush_info(&wip, &cols, 0));

        registry.mark_rotated("active/t/s/0/0", "final/t/s/0/0");
        assert!(!registry.is_unrotated("active/t/s/0/0"));
        assert_eq!(
            registry.file_name_for_rotated_segment("active/t/s/0/0").as_deref(),
            Some("final/t/s/0/0")
        );

        assert_eq!(registry.prune_recently_rotated(RECENTLY_ROTATED_TTL), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.prune_recently_rotated(Duration::ZERO), 1);
        assert!(!registry.is_recently_rotated("active/t/s/0/0"));
    }
}
