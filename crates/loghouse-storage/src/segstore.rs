//! Segment Stores
//!
//! A [`SegStore`] owns the segment one stream is currently writing: the WIP
//! block that fills in memory, the statistics accumulated over every block
//! flushed so far, and the optional star-tree built for the segment.
//!
//! ## Lifecycle
//!
//! ```text
//!            add_entry                  flush_block
//!   Reset ──────────────► Filling ─────────────────► Filling (next block)
//!     ▲                                    │
//!     │                                    │ size / time / tree-size / force
//!     │         next suffix                ▼
//!     └────────────────────────────── Rotating
//! ```
//!
//! A block is flushed when the next record could overflow the write buffer,
//! when it holds [`MAX_RECS_PER_WIP`] records, or when a background loop finds
//! the store idle. Rotation renames the active segment directory to its final
//! location, uploads it, appends its [`SegMeta`] and starts a fresh segment
//! under a new suffix.
//!
//! ## File Layout
//!
//! ```text
//! <data>/<host>/active/<table>/<stream>/<suffix>/
//!     <suffix>_<hash>.csg      column blocks
//!     <suffix>_<hash>.cmi      bloom / range records
//!     <suffix>.bsu             block summaries
//!     <suffix>.sst             segment statistics
//!     <suffix>.sid             running metadata
//!     <suffix>.strm/.strl      star-tree (written at rotation)
//!     <suffix>/pqmr/<pqid>.pqmr
//!     rups/<hash>.crup
//! ```
//!
//! ## Concurrency
//!
//! A store is not internally synchronized; the registry wraps each one in a
//! mutex so ingest, flush and rotation of a stream never overlap. Inside one
//! flush the column blocks are compressed and written in parallel on the
//! rayon pool, each task touching only its own column's buffer and files.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loghouse_core::EncodingType;
use rayon::prelude::*;

use crate::blocksummary::{bsu_path, flush_block_summary, BlockMetadataHolder};
use crate::config::{FD_ACQUIRE_RETRIES, MAX_RECORD_SIZE, MAX_RECS_PER_WIP, WIP_NUM_RECS, WIP_SIZE};
use crate::csg::encode_column_block;
use crate::env::WriterEnv;
use crate::error::{Error, Result};
use crate::fileutils::{append_block, file_size, list_files_recursive, remove_dir_if_empty};
use crate::microindex::{cmi_path, csg_path, flush_bloom, flush_range};
use crate::pqmr::{flush_pqmr, pqmr_path};
use crate::query::PqColumnTracker;
use crate::segmeta::{write_running_meta, ColSizeInfo, SegMeta};
use crate::segstats::{flush_seg_stats, sst_path, SegStatsMap};
use crate::startree::{strl_path, strm_path, ComputeOutcome, PooledBuilder};
use crate::unrotated::BlockFlushInfo;
use crate::wip::{EncodeContext, SeenColumns, SignalType, WipBlock};

/// Per-store ingestion switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Never dictionary-encode strings
    pub skip_de: bool,
    /// Write column data only, without bloom/range records
    pub skip_microindex: bool,
}

/// Result of flushing one column's block.
#[derive(Debug)]
struct ColumnFlush {
    cname: String,
    offset: u64,
    len: u32,
    index_bytes: u64,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct SegStore {
    env: Arc<WriterEnv>,
    stream_id: String,
    table: String,
    org_id: u64,
    options: StoreOptions,

    suffix: u64,
    segment_key: String,
    segbase_dir: String,
    earliest_ms: u64,
    latest_ms: u64,
    record_count: u64,
    bytes_received: u64,
    on_disk_bytes: u64,
    num_blocks: u16,

    wip: WipBlock,
    seen: SeenColumns,
    seg_stats: SegStatsMap,
    pq_tracker: PqColumnTracker,
    /// pqid -> whether any block of the segment matched
    pq_non_empty: HashMap<String, bool>,

    star_tree: Option<PooledBuilder>,
    /// Set once the tree was dropped, so later blocks do not restart it
    star_tree_dropped: bool,

    time_created_ms: u64,
    last_updated_ms: u64,
    /// Arrival time of the oldest record still in the WIP block
    first_pending_ms: Option<u64>,
}

impl std::fmt::Debug for SegStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegStore")
            .field("stream_id", &self.stream_id)
            .field("table", &self.table)
            .field("segment_key", &self.segment_key)
            .field("record_count", &self.record_count)
            .field("num_blocks", &self.num_blocks)
            .finish_non_exhaustive()
    }
}

impl SegStore {
    /// Open a store on a fresh segment of `stream_id`.
    pub fn new(
        env: Arc<WriterEnv>,
        stream_id: &str,
        table: &str,
        org_id: u64,
        options: StoreOptions,
    ) -> Result<Self> {
        let suffix = env.suffixes.next_suffix(stream_id, table)?;
        let wip = WipBlock::new(Arc::clone(&env.buffer_pool), env.config.wip_card_limit);
        let now = now_ms();
        let mut store = Self {
            env,
            stream_id: stream_id.to_string(),
            table: table.to_string(),
            org_id,
            options,
            suffix,
            segment_key: String::new(),
            segbase_dir: String::new(),
            earliest_ms: 0,
            latest_ms: 0,
            record_count: 0,
            bytes_received: 0,
            on_disk_bytes: 0,
            num_blocks: 0,
            wip,
            seen: SeenColumns::new(),
            seg_stats: SegStatsMap::new(),
            pq_tracker: PqColumnTracker::new(),
            pq_non_empty: HashMap::new(),
            star_tree: None,
            star_tree_dropped: false,
            time_created_ms: now,
            last_updated_ms: now,
            first_pending_ms: None,
        };
        store.reset_seg_store()?;
        Ok(store)
    }

    /// Point the store at the segment named by `self.suffix` and clear
    /// everything accumulated for the previous one.
    fn reset_seg_store(&mut self) -> Result<()> {
        let dir = self
            .env
            .config
            .active_segment_dir(&self.table, &self.stream_id, self.suffix);
        fs::create_dir_all(&dir)?;
        self.segment_key = format!("{}{}", dir, self.suffix);
        self.segbase_dir = dir;

        self.earliest_ms = 0;
        self.latest_ms = 0;
        self.record_count = 0;
        self.bytes_received = 0;
        self.on_disk_bytes = 0;
        self.num_blocks = 0;

        self.seen.clear();
        self.seg_stats.clear();
        self.pq_non_empty.clear();
        self.pq_tracker = PqColumnTracker::new();

        self.wip.release_columns();
        self.wip.clear_pq_matches();
        self.star_tree = None;
        self.star_tree_dropped = false;

        self.time_created_ms = now_ms();

        tracing::debug!(segkey = %self.segment_key, stream = %self.stream_id, "Reset segment store");
        self.reset_wip_block(false)
    }

    /// Clear the WIP block for the next batch of records.
    ///
    /// Unless the store is being force-rotated, the current persistent
    /// searches of the table are fetched so the next block tracks them.
    fn reset_wip_block(&mut self, force_rotate: bool) -> Result<()> {
        self.wip.reset(self.env.config.col_wips_size_limit);
        if self.env.config.low_memory_mode {
            self.wip.release_columns();
        }
        self.first_pending_ms = None;

        if force_rotate {
            return Ok(());
        }
        let searches = self
            .env
            .query_provider
            .top_persistent_searches(&self.table, self.org_id)?;
        for (pqid, query) in searches {
            self.wip.ensure_pq_match(&pqid, WIP_NUM_RECS);
            self.pq_non_empty.entry(pqid.clone()).or_insert(false);
            self.pq_tracker.add_query(&pqid, query);
        }
        Ok(())
    }

    /// Ingest one JSON record.
    ///
    /// The WIP block is flushed first when the record might not fit, and
    /// again afterwards when `flush` is set.
    ///
    /// ## Arguments
    ///
    /// * `raw` - The record as a JSON object
    /// * `ts_ms` - Record time in epoch milliseconds
    /// * `bytes_received` - Size of the record as received, for accounting
    /// * `flush` - Flush the block after this record
    /// * `signal` - Kind of record
    pub fn add_entry(
        &mut self,
        raw: &[u8],
        ts_ms: u64,
        bytes_received: u64,
        flush: bool,
        signal: SignalType,
    ) -> Result<bool> {
        if self.wip.max_idx() as usize + MAX_RECORD_SIZE >= WIP_SIZE
            || self.wip.rec_count() >= MAX_RECS_PER_WIP
        {
            self.append_wip_to_segfile(false, false)?;
        }

        let matched = self.write_packed_record(raw, ts_ms, signal)?;

        if self.earliest_ms == 0 || ts_ms < self.earliest_ms {
            self.earliest_ms = ts_ms;
        }
        if ts_ms > self.latest_ms {
            self.latest_ms = ts_ms;
        }
        self.bytes_received += bytes_received;

        if flush {
            self.append_wip_to_segfile(false, false)?;
        }
        Ok(matched)
    }

    /// Encode one record into the WIP block.
    ///
    /// ## Returns
    ///
    /// Whether the record touched a column of a tracked persistent query.
    pub fn write_packed_record(&mut self, raw: &[u8], ts_ms: u64, signal: SignalType) -> Result<bool> {
        match signal {
            SignalType::Events | SignalType::JaegerTraces => {}
            other => {
                tracing::error!(stream = %self.stream_id, signal = ?other, "Unsupported signal type for column encoding");
                return Err(Error::UnknownSignalType);
            }
        }

        let rec_num = self.wip.rec_count();
        let mut ctx = EncodeContext {
            ts_key: &self.env.config.timestamp_key,
            signal,
            skip_de: self.options.skip_de,
            pq_tracker: &self.pq_tracker,
            seen: &mut self.seen,
            seg_stats: &mut self.seg_stats,
            segment_is_empty: self.record_count == 0,
        };
        let (max_idx, matched) = self.wip.encode_columns(raw, ts_ms, &mut ctx)?;
        if matched {
            self.wip.apply_streaming_search(
                &self.pq_tracker,
                self.env.streaming_search.as_ref(),
                rec_num,
            );
        }
        self.wip.commit_record(max_idx);

        self.record_count += 1;
        let now = now_ms();
        self.last_updated_ms = now;
        self.first_pending_ms.get_or_insert(now);
        Ok(matched)
    }

    /// Flush the WIP block to the segment files and rotate when a trigger
    /// fired.
    ///
    /// Column types are consolidated first. An empty block writes nothing;
    /// a segment without any flushed block is never rotated.
    pub fn append_wip_to_segfile(&mut self, force_rotate: bool, on_time_rotate: bool) -> Result<()> {
        self.wip.consolidate_column_types();
        if self.wip.max_idx() > 0 || self.wip.rec_count() > 0 {
            self.flush_block(force_rotate)?;
        }
        if self.num_blocks > 0 {
            self.check_and_rotate(force_rotate, on_time_rotate)?;
        }
        Ok(())
    }

    fn flush_block(&mut self, force_rotate: bool) -> Result<()> {
        let blk_num = self.num_blocks;
        let needed = 2 * self.wip.num_columns() + 2;
        let _fds = self
            .env
            .fd_limiter
            .try_acquire_with_backoff(needed, FD_ACQUIRE_RETRIES, &self.segment_key)?;

        if self.env.config.aggregations_enabled {
            self.compute_star_tree();
        }

        let ts_key = self.env.config.timestamp_key.clone();
        if let Err(e) = self.wip.rollups().write(&self.segment_key, &ts_key, blk_num) {
            tracing::error!(segkey = %self.segment_key, error = %e, "Failed to write rollups");
        }

        let flushed = self.flush_columns(blk_num, &ts_key);

        let mut bmh = BlockMetadataHolder::new(blk_num);
        let mut total_bytes = 0u64;
        let mut index_bytes = 0u64;
        for col in &flushed {
            bmh.record_column(&col.cname, col.offset, col.len);
            total_bytes += col.len as u64 + col.index_bytes;
            index_bytes += col.index_bytes;
        }
        for bloom in self.wip.col_blooms.values_mut() {
            bloom.record_block_count();
        }

        let summary = *self.wip.summary();
        match flush_block_summary(&bsu_path(&self.segment_key), &bmh, &summary, blk_num) {
            Ok(n) => total_bytes += n as u64,
            Err(e) => {
                tracing::error!(segkey = %self.segment_key, error = %e, "Failed to write block summary")
            }
        }

        if !self.options.skip_microindex {
            self.env.unrotated.update_block_info(BlockFlushInfo {
                segkey: &self.segment_key,
                table_name: &self.table,
                org_id: self.org_id,
                blk_num,
                wip: &self.wip,
                block_meta: bmh,
                all_columns: self.seen.names(),
                earliest_ms: self.earliest_ms,
                latest_ms: self.latest_ms,
                record_count: self.record_count,
                metadata_size: index_bytes,
            });
        }

        for (pqid, bitmap) in &self.wip.pq_matches {
            let non_empty = self.pq_non_empty.entry(pqid.clone()).or_insert(false);
            *non_empty |= bitmap.any();
            match flush_pqmr(&pqmr_path(&self.segment_key, pqid), blk_num, bitmap) {
                Ok(n) => total_bytes += n as u64,
                Err(e) => {
                    tracing::error!(segkey = %self.segment_key, pqid = %pqid, error = %e, "Failed to write pqmr")
                }
            }
        }

        match flush_seg_stats(&sst_path(&self.segment_key), &self.seg_stats) {
            Ok(_) => {}
            Err(Error::NoSegStats) => {
                tracing::debug!(segkey = %self.segment_key, "No segment statistics yet")
            }
            Err(e) => {
                tracing::error!(segkey = %self.segment_key, error = %e, "Failed to write segment statistics")
            }
        }

        self.on_disk_bytes += total_bytes;
        self.num_blocks += 1;
        if let Err(e) = write_running_meta(&self.segment_key, &self.current_segmeta(&self.segment_key, &self.segbase_dir)) {
            tracing::error!(segkey = %self.segment_key, error = %e, "Failed to write running metadata");
        }

        tracing::debug!(
            segkey = %self.segment_key,
            blk_num,
            records = summary.rec_count,
            columns = flushed.len(),
            bytes = total_bytes,
            "Flushed WIP block"
        );

        self.reset_wip_block(force_rotate)
    }

    /// Compress and write every column of the block in parallel.
    ///
    /// A column whose data write fails is logged and left out of the block
    /// metadata; bloom and range failures only lose the index record.
    fn flush_columns(&self, blk_num: u16, ts_key: &str) -> Vec<ColumnFlush> {
        let wip = &self.wip;
        let segkey = self.segment_key.as_str();
        let pool = self.env.buffer_pool.as_ref();
        let skip_microindex = self.options.skip_microindex;

        wip.col_wips
            .par_iter()
            .filter(|(cname, cw)| {
                if cname.as_str() == ts_key {
                    wip.rec_count() > 0
                } else {
                    !cw.is_empty()
                }
            })
            .filter_map(|(cname, cw)| {
                let mut payload = pool.get();
                let enc = if cname.as_str() == ts_key {
                    wip.encode_timestamps(&mut payload);
                    EncodingType::TimestampTopDiffVarEnc
                } else if cw.dict().is_usable() {
                    cw.pack_dict_into(&mut payload);
                    EncodingType::Dictionary
                } else {
                    payload.extend_from_slice(cw.as_bytes());
                    EncodingType::Columnar
                };

                let mut block = pool.get();
                let written = encode_column_block(enc, &payload, &mut block)
                    .and_then(|()| append_block(&csg_path(segkey, cname), &block).map(|off| (off, block.len())));
                pool.put(payload);
                pool.put(block);

                let (offset, len) = match written {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(segkey = %segkey, column = %cname, error = %e, "Failed to write column block");
                        return None;
                    }
                };

                let mut index_bytes = 0u64;
                if !skip_microindex {
                    let cmi = cmi_path(segkey, cname);
                    if let Some(bloom) = wip.bloom(cname) {
                        match flush_bloom(&cmi, blk_num, bloom) {
                            Ok(n) => index_bytes += n as u64,
                            Err(e) => {
                                tracing::error!(segkey = %segkey, column = %cname, error = %e, "Failed to write bloom")
                            }
                        }
                    }
                    if let Some(range) = wip.range(cname).filter(|r| !r.is_empty()) {
                        match flush_range(&cmi, blk_num, range) {
                            Ok(n) => index_bytes += n as u64,
                            Err(e) => {
                                tracing::error!(segkey = %segkey, column = %cname, error = %e, "Failed to write range index")
                            }
                        }
                    }
                }

                Some(ColumnFlush {
                    cname: cname.clone(),
                    offset,
                    len: len as u32,
                    index_bytes,
                })
            })
            .collect()
    }

    /// Fold the block into the segment's star-tree.
    ///
    /// The first block of a segment picks the group-by columns from the
    /// table's persistent aggregations, lowest cardinality first. A tree that
    /// cannot be built is dropped for the rest of the segment.
    fn compute_star_tree(&mut self) {
        if self.star_tree_dropped {
            return;
        }
        if self.star_tree.is_none() {
            if self.num_blocks > 0 {
                // a tree must cover the segment from its first block
                self.star_tree_dropped = true;
                return;
            }
            let aggs = self.env.query_provider.top_persistent_aggs(&self.table);
            let mut group_by: Vec<String> = aggs
                .group_by
                .into_iter()
                .filter(|c| self.wip.col_wips.contains_key(c) && self.seg_stats.contains_key(c))
                .collect();
            group_by.sort_by_key(|c| self.seg_stats.get(c).map(|s| s.cardinality()).unwrap_or(0));
            let measures: Vec<String> = aggs
                .measures
                .into_iter()
                .filter(|c| self.wip.col_wips.contains_key(c))
                .collect();
            if group_by.is_empty() || measures.is_empty() {
                tracing::debug!(segkey = %self.segment_key, "No persistent aggregation applies, skipping star-tree");
                self.star_tree_dropped = true;
                return;
            }

            let Some(mut builder) = self.env.star_trees.try_get() else {
                tracing::warn!(segkey = %self.segment_key, "Star-tree pool exhausted, skipping star-tree");
                self.star_tree_dropped = true;
                return;
            };
            builder.reset_seg_tree(group_by, measures, self.env.config.star_tree_card_limit);
            self.star_tree = Some(builder);
        }

        let Some(tree) = self.star_tree.as_mut() else {
            return;
        };
        match tree.compute_star_tree(&self.wip) {
            Ok(ComputeOutcome::Built) => {}
            Ok(ComputeOutcome::CardinalityExceeded { column }) => {
                tracing::warn!(segkey = %self.segment_key, column = %column, "Star-tree column cardinality above limit, dropping tree");
                self.drop_star_tree();
            }
            Err(e) => {
                tracing::error!(segkey = %self.segment_key, error = %e, "Star-tree compute failed, dropping tree");
                self.drop_star_tree();
            }
        }
    }

    fn drop_star_tree(&mut self) {
        self.star_tree = None;
        self.star_tree_dropped = true;
    }

    fn check_and_rotate(&mut self, force_rotate: bool, on_time_rotate: bool) -> Result<()> {
        let tree_too_big = self
            .star_tree
            .as_ref()
            .is_some_and(|t| t.node_count() > self.env.config.max_agile_tree_node_count);
        let too_big = self.on_disk_bytes > self.env.config.max_seg_file_size;
        if !(too_big || force_rotate || on_time_rotate || tree_too_big) {
            return Ok(());
        }
        self.rotate(force_rotate)
    }

    /// Finalize the current segment.
    ///
    /// The active directory is renamed in one step. If the rename fails the
    /// segment stays active and untouched, star-tree included; everything
    /// after the rename is best effort, with the `.sid` in the final
    /// directory as the record of the segment until its log entry is written.
    fn rotate(&mut self, force_rotate: bool) -> Result<()> {
        let active_key = self.segment_key.clone();

        let mut tree_bytes = 0;
        if let Some(tree) = self.star_tree.as_mut() {
            match tree.encode_star_tree(&active_key) {
                Ok(n) => tree_bytes = n,
                Err(e) => tracing::error!(segkey = %active_key, error = %e, "Failed to write star-tree"),
            }
        }
        self.on_disk_bytes += tree_bytes;

        let final_dir = self
            .env
            .config
            .final_segment_dir(&self.table, &self.stream_id, self.suffix);
        let final_key = format!("{}{}", final_dir, self.suffix);

        if let Err(e) = self.move_to_final(&active_key, &final_dir) {
            self.on_disk_bytes -= tree_bytes;
            remove_star_tree_files(&active_key);
            return Err(e);
        }
        // back to the pool
        self.star_tree = None;
        self.remove_unmatched_pqmr_files(&final_key);

        let meta = self.current_segmeta(&final_key, &final_dir);
        match list_files_recursive(Path::new(&final_dir)) {
            Ok(files) => {
                if let Err(e) = self.env.uploader.upload_segment_files(&files) {
                    tracing::error!(segkey = %final_key, error = %e, "Failed to upload segment files");
                }
            }
            Err(e) => tracing::error!(segkey = %final_key, error = %e, "Failed to list segment files"),
        }
        if let Err(e) = self
            .env
            .segmeta
            .add_new_rotated_segment(&meta, self.env.uploader.as_ref())
        {
            tracing::error!(segkey = %final_key, error = %e, "Failed to append segment metadata");
        }

        self.env.unrotated.mark_rotated(&active_key, &final_key);
        if let Err(e) = self.env.uploader.upload_ingest_node_dir() {
            tracing::error!(error = %e, "Failed to upload ingest node directory");
        }

        tracing::info!(
            from = %active_key,
            to = %final_key,
            records = self.record_count,
            blocks = self.num_blocks,
            bytes = self.on_disk_bytes,
            "Rotated segment"
        );

        if force_rotate {
            return Ok(());
        }
        self.suffix = self.env.suffixes.next_suffix(&self.stream_id, &self.table)?;
        self.reset_seg_store()
    }

    /// Write the final `.sid` and rename the active directory to `final_dir`.
    fn move_to_final(&self, active_key: &str, final_dir: &str) -> Result<()> {
        // the .sid moves with the directory and must describe the final state
        write_running_meta(active_key, &self.current_segmeta(active_key, &self.segbase_dir))?;

        if let Some(parent) = Path::new(final_dir.trim_end_matches('/')).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.segbase_dir.trim_end_matches('/'), final_dir.trim_end_matches('/')).map_err(|e| {
            Error::Rotation(format!(
                "rename {} -> {} failed: {}",
                self.segbase_dir, final_dir, e
            ))
        })
    }

    fn remove_unmatched_pqmr_files(&self, segkey: &str) {
        for (pqid, matched) in &self.pq_non_empty {
            if *matched {
                continue;
            }
            let path = pqmr_path(segkey, pqid);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "Failed to remove empty pqmr file")
                }
            }
        }
        let pqmr_dir = Path::new(segkey).join("pqmr");
        for dir in [pqmr_dir.as_path(), Path::new(segkey)] {
            if let Err(e) = remove_dir_if_empty(dir) {
                tracing::error!(dir = %dir.display(), error = %e, "Failed to remove empty pqmr directory");
            }
        }
    }

    /// On-disk sizes of every seen column except the timestamp.
    fn column_sizes(&self, segkey: &str) -> BTreeMap<String, ColSizeInfo> {
        let ts_key = self.env.config.timestamp_key.as_str();
        self.seen
            .names()
            .iter()
            .filter(|c| c.as_str() != ts_key)
            .map(|c| {
                let info = ColSizeInfo {
                    cmi_size: file_size(&cmi_path(segkey, c)).unwrap_or(0),
                    csg_size: file_size(&csg_path(segkey, c)).unwrap_or(0),
                };
                (c.clone(), info)
            })
            .collect()
    }

    fn current_segmeta(&self, segkey: &str, segbase_dir: &str) -> SegMeta {
        let all_pqids: BTreeSet<String> = self
            .pq_non_empty
            .iter()
            .filter(|(_, matched)| **matched)
            .map(|(pqid, _)| pqid.clone())
            .collect();
        SegMeta {
            segment_key: segkey.to_string(),
            earliest_epoch_ms: self.earliest_ms,
            latest_epoch_ms: self.latest_ms,
            segbase_dir: segbase_dir.to_string(),
            virtual_table_name: self.table.clone(),
            record_count: self.record_count,
            bytes_received_count: self.bytes_received,
            on_disk_bytes: self.on_disk_bytes,
            column_names: self.column_sizes(segkey),
            all_pqids,
            num_blocks: self.num_blocks,
            org_id: self.org_id,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn org_id(&self) -> u64 {
        self.org_id
    }

    pub fn suffix(&self) -> u64 {
        self.suffix
    }

    pub fn segment_key(&self) -> &str {
        &self.segment_key
    }

    pub fn segbase_dir(&self) -> &str {
        &self.segbase_dir
    }

    pub fn segment_dir(&self) -> PathBuf {
        PathBuf::from(&self.segbase_dir)
    }

    /// Records in the current segment, flushed or not.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn on_disk_bytes(&self) -> u64 {
        self.on_disk_bytes
    }

    pub fn num_blocks(&self) -> u16 {
        self.num_blocks
    }

    pub fn earliest_ms(&self) -> u64 {
        self.earliest_ms
    }

    pub fn latest_ms(&self) -> u64 {
        self.latest_ms
    }

    pub fn wip(&self) -> &WipBlock {
        &self.wip
    }

    pub fn seen_columns(&self) -> &SeenColumns {
        &self.seen
    }

    pub fn seg_stats(&self) -> &SegStatsMap {
        &self.seg_stats
    }

    pub fn is_using_star_tree(&self) -> bool {
        self.star_tree.is_some()
    }

    pub fn star_tree(&self) -> Option<&PooledBuilder> {
        self.star_tree.as_ref()
    }

    pub fn time_created_ms(&self) -> u64 {
        self.time_created_ms
    }

    pub fn last_updated_ms(&self) -> u64 {
        self.last_updated_ms
    }

    pub fn first_pending_ms(&self) -> Option<u64> {
        self.first_pending_ms
    }

    /// Remove the active directory of a segment that never received data.
    pub fn remove_empty_segment_dir(&self) -> Result<bool> {
        if self.num_blocks > 0 || self.has_pending() {
            return Ok(false);
        }
        remove_dir_if_empty(Path::new(&self.segbase_dir))
    }

    /// The WIP block holds records not yet on disk.
    pub fn has_pending(&self) -> bool {
        self.wip.rec_count() > 0
    }
}

/// Remove a star-tree written for a rotation that did not complete.
fn remove_star_tree_files(segkey: &str) {
    for path in [strm_path(segkey), strl_path(segkey)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::error!(file = %path.display(), error = %e, "Failed to remove star-tree file"),
        }
    }
}

impl Drop for SegStore {
    fn drop(&mut self) {
        self.wip.release_columns();
    }
}
