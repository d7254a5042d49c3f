//! WIP Blocks - In-Memory Column Encoding
//!
//! A `WipBlock` collects the records of one block before they are flushed.
//! Every column owns a [`ColWip`] holding one TLV value per block record, so
//! record `n` of every column buffer belongs to the same ingested record.
//!
//! ## Record Encoding
//!
//! [`WipBlock::encode_columns`] parses one JSON record and walks it:
//!
//! - nested objects flatten to dotted keys (`a.b.c`)
//! - arrays flatten to indexed keys (`tags.0`, `tags.1`) except for trace
//!   records, where `references`/`logs` arrays are stored as raw JSON and all
//!   other arrays as dict arrays of `{key, type, value}` entries
//! - the configured timestamp key is never stored as a field; its value goes
//!   to the block's timestamp array and minute/hour/day rollups
//!
//! ## Backfill
//!
//! A column first seen after the block already holds `n` records gets `n`
//! backfill markers before its value. A column missing from a record gets one
//! backfill marker after the record's own fields are written. Every column
//! buffer therefore advances exactly one value per record.
//!
//! ## Micro-Indices
//!
//! Strings and bools feed a per-column bloom filter (strings are split on
//! whitespace and case-folded, see [`BloomIndex`]); numbers feed a range
//! index. `_type` and `_index` never get a bloom. A column that ends a block
//! with both a bloom and a range index held mixed values, and
//! [`WipBlock::consolidate_column_types`] rewrites it as all numbers if every
//! string parses, else as all strings.
//!
//! ## Column Sizes
//!
//! [`SeenColumns`] tracks, per segment, whether every value of a column so
//! far had the same encoded length. The first record of a segment fixes the
//! length; a late column, a backfill or a differing length marks the column
//! [`INCONSISTENT_CVAL_SIZE`] for the rest of the segment.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use loghouse_core::value::MAX_SMALL_STRING_LEN;
use loghouse_core::{
    decode_value, encode_backfill, encode_bool, encode_dict_array, encode_number,
    encode_number_wide, encode_raw_json, encode_str, tlv_len, BufferPool, CValue,
    DictArrayEntry, Number,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blocksummary::BlockSummary;
use crate::bloom::BloomIndex;
use crate::colwip::ColWip;
use crate::config::WIP_NUM_RECS;
use crate::error::{Error, Result};
use crate::pqmr::RecordBitmap;
use crate::query::{PqColumnTracker, StreamingSearch, WipRecordView};
use crate::range::RangeIndex;
use crate::segstats::{add_seg_stats_num, add_seg_stats_str, SegStatsMap};
use crate::timestamp::{encode_timestamps, Rollups};

/// Column size marker once values of a column stopped sharing one length.
pub const INCONSISTENT_CVAL_SIZE: u32 = u32::MAX;

/// Kind of data a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    Events,
    JaegerTraces,
    MetricsOtsdb,
}

/// Columns seen in the current segment and their encoded value sizes.
#[derive(Debug, Clone, Default)]
pub struct SeenColumns {
    names: BTreeSet<String>,
    sizes: HashMap<String, u32>,
}

impl SeenColumns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `cname` was not seen before in this segment.
    pub(crate) fn insert(&mut self, cname: &str) -> bool {
        if self.names.contains(cname) {
            return false;
        }
        self.names.insert(cname.to_string());
        true
    }

    pub fn contains(&self, cname: &str) -> bool {
        self.names.contains(cname)
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn sizes(&self) -> &HashMap<String, u32> {
        &self.sizes
    }

    /// Fixed encoded size of the column, or [`INCONSISTENT_CVAL_SIZE`].
    pub fn size(&self, cname: &str) -> Option<u32> {
        self.sizes.get(cname).copied()
    }

    pub(crate) fn record_value_size(
        &mut self,
        cname: &str,
        len: usize,
        first_in_segment: bool,
        segment_is_empty: bool,
    ) {
        let len = len as u32;
        if first_in_segment {
            let size = if segment_is_empty {
                len
            } else {
                INCONSISTENT_CVAL_SIZE
            };
            self.sizes.insert(cname.to_string(), size);
            return;
        }
        match self.sizes.get_mut(cname) {
            Some(size) if *size != len => *size = INCONSISTENT_CVAL_SIZE,
            Some(_) => {}
            None => {
                self.sizes.insert(cname.to_string(), INCONSISTENT_CVAL_SIZE);
            }
        }
    }

    pub(crate) fn mark_inconsistent(&mut self, cname: &str) {
        self.sizes.insert(cname.to_string(), INCONSISTENT_CVAL_SIZE);
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.sizes.clear();
    }
}

/// Store-level state that encoding one record reads or updates.
pub struct EncodeContext<'a> {
    pub ts_key: &'a str,
    pub signal: SignalType,
    /// Skip dictionary encoding for strings
    pub skip_de: bool,
    pub pq_tracker: &'a PqColumnTracker,
    pub seen: &'a mut SeenColumns,
    pub seg_stats: &'a mut SegStatsMap,
    /// The segment holds no records yet
    pub segment_is_empty: bool,
}

#[derive(Debug, Clone, Copy)]
enum Leaf<'v> {
    Str(&'v str),
    Num(Number),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    String,
    Number,
    Bool,
    Other,
}

impl Leaf<'_> {
    fn kind(&self) -> ValueKind {
        match self {
            Leaf::Str(_) => ValueKind::String,
            Leaf::Num(_) => ValueKind::Number,
            Leaf::Bool(_) => ValueKind::Bool,
            Leaf::Null => ValueKind::Other,
        }
    }
}

#[derive(Debug, Default)]
struct RecordState {
    max_idx: u32,
    matched: bool,
}

fn has_bloom(cname: &str) -> bool {
    cname != "_type" && cname != "_index"
}

fn truncate_utf8(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Append a small string, truncating at the 16-bit length limit.
fn put_small_str(buf: &mut Vec<u8>, cname: &str, value: &[u8]) {
    if let Err(e) = encode_str(buf, value) {
        tracing::warn!(column = %cname, error = %e, "String not encodable, storing backfill");
        encode_backfill(buf);
    }
}

/// One block of records being encoded column by column.
#[derive(Debug)]
pub struct WipBlock {
    pub(crate) col_wips: HashMap<String, ColWip>,
    pub(crate) columns_in_block: HashMap<String, bool>,
    pub(crate) col_blooms: HashMap<String, BloomIndex>,
    pub(crate) col_ranges: HashMap<String, RangeIndex>,
    pub(crate) block_ts: Vec<u64>,
    pub(crate) rollups: Rollups,
    pub(crate) pq_matches: HashMap<String, RecordBitmap>,
    pub(crate) summary: BlockSummary,
    pub(crate) max_idx: u32,
    dict_ceiling: u16,
    pool: Arc<BufferPool>,
}

impl WipBlock {
    pub fn new(pool: Arc<BufferPool>, dict_ceiling: u16) -> Self {
        Self {
            col_wips: HashMap::new(),
            columns_in_block: HashMap::new(),
            col_blooms: HashMap::new(),
            col_ranges: HashMap::new(),
            block_ts: Vec::with_capacity(WIP_NUM_RECS),
            rollups: Rollups::default(),
            pq_matches: HashMap::new(),
            summary: BlockSummary::default(),
            max_idx: 0,
            dict_ceiling,
            pool,
        }
    }

    pub fn rec_count(&self) -> u16 {
        self.summary.rec_count
    }

    /// Largest column buffer written so far.
    pub fn max_idx(&self) -> u32 {
        self.max_idx
    }

    pub fn summary(&self) -> &BlockSummary {
        &self.summary
    }

    pub fn block_ts(&self) -> &[u64] {
        &self.block_ts[..self.rec_count() as usize]
    }

    pub fn col_wip(&self, cname: &str) -> Option<&ColWip> {
        self.col_wips.get(cname)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.col_wips.keys().map(String::as_str)
    }

    pub fn num_columns(&self) -> usize {
        self.col_wips.len()
    }

    pub fn bloom(&self, cname: &str) -> Option<&BloomIndex> {
        self.col_blooms.get(cname)
    }

    pub fn range(&self, cname: &str) -> Option<&RangeIndex> {
        self.col_ranges.get(cname)
    }

    pub fn rollups(&self) -> &Rollups {
        &self.rollups
    }

    pub fn pq_match(&self, pqid: &str) -> Option<&RecordBitmap> {
        self.pq_matches.get(pqid)
    }

    pub fn is_empty(&self) -> bool {
        self.summary.rec_count == 0
    }

    /// Encode one JSON record into the column buffers.
    ///
    /// The record is parsed before anything is written, so a malformed record
    /// leaves the block untouched. The caller commits the record with
    /// [`WipBlock::commit_record`].
    ///
    /// ## Returns
    ///
    /// `(max_idx, matched)`: the largest column buffer touched and whether the
    /// record touched a column of a tracked persistent query.
    pub fn encode_columns(
        &mut self,
        raw: &[u8],
        record_time: u64,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<(u32, bool)> {
        let record: Value = serde_json::from_slice(raw)?;
        let fields = match &record {
            Value::Object(fields) => fields,
            other => {
                return Err(Error::MalformedRecord(format!(
                    "record must be a JSON object, got {}",
                    json_kind(other)
                )))
            }
        };

        let rec_num = self.summary.rec_count;
        self.encode_time(record_time, ctx);

        let mut state = RecordState::default();
        self.encode_object("", fields, ctx, &mut state);

        for (cname, found) in self.columns_in_block.iter_mut() {
            if *found {
                *found = false;
                continue;
            }
            let Some(cw) = self.col_wips.get_mut(cname) else {
                tracing::error!(column = %cname, "Backfill requested for a column without a buffer");
                continue;
            };
            cw.start_record();
            encode_backfill(&mut cw.buf);
            cw.dict.add_backfill(rec_num);
            ctx.seen.mark_inconsistent(cname);
            state.max_idx = state.max_idx.max(cw.len() as u32);
        }

        Ok((state.max_idx, state.matched))
    }

    /// Count the record encoded last into the block.
    pub fn commit_record(&mut self, max_idx: u32) {
        self.max_idx = self.max_idx.max(max_idx);
        self.summary.rec_count += 1;
    }

    fn encode_time(&mut self, record_time: u64, ctx: &mut EncodeContext<'_>) {
        let rec_num = self.summary.rec_count;
        if !self.col_wips.contains_key(ctx.ts_key) {
            let cw = ColWip::from_pool(&self.pool, self.dict_ceiling);
            self.col_wips.insert(ctx.ts_key.to_string(), cw);
        }
        ctx.seen.insert(ctx.ts_key);
        self.columns_in_block.insert(ctx.ts_key.to_string(), true);

        self.block_ts.truncate(rec_num as usize);
        self.block_ts.push(record_time);
        self.summary.adjust_earliest_latest(record_time);
        self.rollups.add(record_time, rec_num);
    }

    fn encode_object(
        &mut self,
        prefix: &str,
        fields: &Map<String, Value>,
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        for (k, v) in fields {
            let key = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{}.{}", prefix, k)
            };
            self.encode_value(&key, v, ctx, state);
        }
    }

    fn encode_array(
        &mut self,
        prefix: &str,
        items: &[Value],
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        for (i, v) in items.iter().enumerate() {
            let key = if prefix.is_empty() {
                i.to_string()
            } else {
                format!("{}.{}", prefix, i)
            };
            match v {
                Value::Array(nested) => self.encode_array(&key, nested, ctx, state),
                other => self.encode_value(&key, other, ctx, state),
            }
        }
    }

    fn encode_value(
        &mut self,
        key: &str,
        value: &Value,
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        match value {
            Value::Object(fields) => self.encode_object(key, fields, ctx, state),
            Value::Array(items) => {
                if ctx.signal == SignalType::JaegerTraces {
                    if key == "references" || key == "logs" {
                        self.encode_raw_json(key, value, ctx, state);
                    } else {
                        self.encode_dict_array(key, items, ctx, state);
                    }
                } else {
                    self.encode_array(key, items, ctx, state);
                }
            }
            Value::String(s) => self.encode_leaf(key, Leaf::Str(s), ctx, state),
            Value::Number(n) => match Number::from_json(n) {
                Some(num) => self.encode_leaf(key, Leaf::Num(num), ctx, state),
                None => tracing::warn!(column = %key, value = %n, "Unrepresentable number skipped"),
            },
            Value::Bool(b) => self.encode_leaf(key, Leaf::Bool(*b), ctx, state),
            Value::Null => self.encode_leaf(key, Leaf::Null, ctx, state),
        }
    }

    /// Create the column if needed, backfill records it missed in this block
    /// and mark it present.
    ///
    /// Returns `None` when the column already holds a value for this record.
    fn init_and_backfill_column(
        &mut self,
        key: &str,
        kind: ValueKind,
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) -> Option<(u16, bool)> {
        let rec_num = self.summary.rec_count;
        if self.columns_in_block.get(key) == Some(&true) {
            tracing::debug!(column = %key, "Column repeated within one record, keeping first value");
            return None;
        }

        let first_in_segment = ctx.seen.insert(key);
        let pool = &self.pool;
        let ceiling = self.dict_ceiling;
        let cw = self
            .col_wips
            .entry(key.to_string())
            .or_insert_with(|| ColWip::from_pool(pool, ceiling));

        if !self.columns_in_block.contains_key(key) && rec_num > 0 {
            tracing::debug!(column = %key, backfilled = rec_num, "New column in the middle of a block, backfilling");
            match kind {
                ValueKind::String if has_bloom(key) => {
                    self.col_blooms
                        .entry(key.to_string())
                        .or_insert_with(BloomIndex::with_default_size);
                }
                ValueKind::Bool => {
                    self.col_blooms
                        .entry(key.to_string())
                        .or_insert_with(BloomIndex::for_bool);
                }
                ValueKind::Number => {
                    self.col_ranges.entry(key.to_string()).or_default();
                }
                _ => {}
            }
            for _ in 0..rec_num {
                encode_backfill(&mut cw.buf);
            }
            cw.dict.add_backfill_prefix(rec_num);
            ctx.seen.mark_inconsistent(key);
        }

        self.columns_in_block.insert(key.to_string(), true);
        state.matched = state.matched || ctx.pq_tracker.is_column_in_pquery(key);
        cw.start_record();
        Some((rec_num, first_in_segment))
    }

    fn encode_leaf(
        &mut self,
        key: &str,
        leaf: Leaf<'_>,
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        if key == ctx.ts_key {
            return;
        }
        let Some((rec_num, first_in_segment)) =
            self.init_and_backfill_column(key, leaf.kind(), ctx, state)
        else {
            return;
        };
        let Some(cw) = self.col_wips.get_mut(key) else {
            return;
        };
        let start = cw.len();

        match leaf {
            Leaf::Str(s) => {
                let bytes = truncate_utf8(s, MAX_SMALL_STRING_LEN);
                if bytes.len() < s.len() {
                    tracing::warn!(column = %key, len = s.len(), "String truncated to the small-string limit");
                }
                put_small_str(&mut cw.buf, key, bytes);
                if has_bloom(key) {
                    self.col_blooms
                        .entry(key.to_string())
                        .or_insert_with(BloomIndex::with_default_size)
                        .add_to_bloom_both_cases(bytes);
                }
                if ctx.skip_de {
                    cw.dict.abandon();
                } else {
                    cw.dict.check_add_dict_entry(&cw.buf[start..], rec_num);
                }
                add_seg_stats_str(ctx.seg_stats, key, bytes);
            }
            Leaf::Num(n) => {
                encode_number(&mut cw.buf, n);
                self.col_ranges
                    .entry(key.to_string())
                    .or_default()
                    .update_range_index(key, n);
                cw.dict.check_add_dict_entry(&cw.buf[start..], rec_num);
                add_seg_stats_num(ctx.seg_stats, key, n);
            }
            Leaf::Bool(b) => {
                encode_bool(&mut cw.buf, b);
                let word: &[u8] = if b { b"true" } else { b"false" };
                self.col_blooms
                    .entry(key.to_string())
                    .or_insert_with(BloomIndex::for_bool)
                    .add_to_bloom_both_cases(word);
                cw.dict.check_add_dict_entry(&cw.buf[start..], rec_num);
            }
            Leaf::Null => {
                encode_backfill(&mut cw.buf);
                cw.dict.add_backfill(rec_num);
            }
        }

        ctx.seen
            .record_value_size(key, cw.len() - start, first_in_segment, ctx.segment_is_empty);
        state.max_idx = state.max_idx.max(cw.len() as u32);
    }

    fn encode_dict_array(
        &mut self,
        key: &str,
        items: &[Value],
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        if key == ctx.ts_key {
            return;
        }
        let Some((rec_num, first_in_segment)) =
            self.init_and_backfill_column(key, ValueKind::Other, ctx, state)
        else {
            return;
        };
        let Some(cw) = self.col_wips.get_mut(key) else {
            return;
        };

        let entries: Vec<DictArrayEntry> = items
            .iter()
            .filter_map(|item| match DictArrayEntry::from_json(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::error!(column = %key, error = %e, "Skipping malformed tag entry");
                    None
                }
            })
            .collect();

        let start = cw.len();
        if let Err(e) = encode_dict_array(&mut cw.buf, &entries) {
            tracing::warn!(column = %key, error = %e, "Tag array too large, storing backfill");
            cw.buf.truncate(start);
            encode_backfill(&mut cw.buf);
        }
        cw.dict.check_add_dict_entry(&cw.buf[start..], rec_num);

        let bloom = self
            .col_blooms
            .entry(key.to_string())
            .or_insert_with(BloomIndex::with_default_size);
        for entry in &entries {
            bloom.add_to_bloom_both_cases(entry.key.as_bytes());
            bloom.add_to_bloom_both_cases(entry.value.as_bytes());
            add_seg_stats_str(ctx.seg_stats, &entry.key, entry.value.as_bytes());
        }

        ctx.seen
            .record_value_size(key, cw.len() - start, first_in_segment, ctx.segment_is_empty);
        state.max_idx = state.max_idx.max(cw.len() as u32);
    }

    fn encode_raw_json(
        &mut self,
        key: &str,
        value: &Value,
        ctx: &mut EncodeContext<'_>,
        state: &mut RecordState,
    ) {
        if key == ctx.ts_key {
            return;
        }
        let Some((rec_num, first_in_segment)) =
            self.init_and_backfill_column(key, ValueKind::Other, ctx, state)
        else {
            return;
        };
        if has_bloom(key) && key != "tags" {
            self.col_blooms
                .entry(key.to_string())
                .or_insert_with(BloomIndex::with_default_size);
        }
        let Some(cw) = self.col_wips.get_mut(key) else {
            return;
        };

        let start = cw.len();
        let written = serde_json::to_vec(value)
            .map_err(Error::from)
            .and_then(|raw| Ok(encode_raw_json(&mut cw.buf, &raw)?));
        if let Err(e) = written {
            tracing::warn!(column = %key, error = %e, "Raw JSON not encodable, storing backfill");
            cw.buf.truncate(start);
            encode_backfill(&mut cw.buf);
        }
        cw.dict.check_add_dict_entry(&cw.buf[start..], rec_num);

        ctx.seen
            .record_value_size(key, cw.len() - start, first_in_segment, ctx.segment_is_empty);
        state.max_idx = state.max_idx.max(cw.len() as u32);
    }

    /// Mark the last committed record in the bitmap of every persistent
    /// query the streaming search says it matches.
    pub fn apply_streaming_search(
        &mut self,
        tracker: &PqColumnTracker,
        search: &dyn StreamingSearch,
        rec_num: u16,
    ) {
        let view = WipRecordView::new(&self.col_wips, rec_num);
        let matched: Vec<&String> = tracker
            .queries()
            .iter()
            .filter(|(pqid, query)| search.matches(pqid, query, &view))
            .map(|(pqid, _)| pqid)
            .collect();
        for pqid in matched {
            self.pq_matches
                .entry(pqid.clone())
                .or_insert_with(|| RecordBitmap::with_capacity(WIP_NUM_RECS))
                .add_matched_record(rec_num);
        }
    }

    /// Make sure `pqid` has a match bitmap, sized for `capacity` records.
    pub(crate) fn ensure_pq_match(&mut self, pqid: &str, capacity: usize) {
        self.pq_matches
            .entry(pqid.to_string())
            .or_insert_with(|| RecordBitmap::with_capacity(capacity));
    }

    /// Rewrite every column that holds both strings and numbers in this block.
    ///
    /// Numbers win if every string parses as an integer or float; otherwise
    /// every value becomes its string rendering. Record order is preserved.
    pub fn consolidate_column_types(&mut self) {
        let mixed: Vec<String> = self
            .columns_in_block
            .keys()
            .filter(|c| self.col_blooms.contains_key(*c) && self.col_ranges.contains_key(*c))
            .cloned()
            .collect();

        for cname in mixed {
            if !self.convert_column_to_numbers(&cname) {
                tracing::debug!(column = %cname, "Mixed column kept as strings");
                self.convert_column_to_strings(&cname);
            }
        }
    }

    fn convert_column_to_numbers(&mut self, cname: &str) -> bool {
        let Some(old) = self.col_wips.get(cname) else {
            return false;
        };
        let buf = old.as_bytes();
        let mut out = self.pool.get();
        let mut parsed = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let (value, _, consumed) = match decode_value(&buf[pos..]) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(column = %cname, error = %e, "Undecodable value during consolidation");
                    self.pool.put(out);
                    return false;
                }
            };
            match value {
                CValue::Str(s) => match Number::parse(&s) {
                    Some(n) => {
                        encode_number_wide(&mut out, n);
                        parsed.push(n);
                    }
                    None => {
                        self.pool.put(out);
                        return false;
                    }
                },
                CValue::Unsigned(_) | CValue::Signed(_) | CValue::Float(_) => {
                    out.extend_from_slice(&buf[pos..pos + consumed]);
                }
                CValue::Backfill => {
                    encode_backfill(&mut out);
                }
                CValue::Bool(_) | CValue::DictArray(_) | CValue::RawJson(_) => {
                    self.pool.put(out);
                    return false;
                }
            }
            pos += consumed;
        }

        let ranges = self.col_ranges.entry(cname.to_string()).or_default();
        for n in parsed {
            ranges.update_range_index(cname, n);
        }
        self.col_blooms.remove(cname);
        self.replace_column(cname, out);
        true
    }

    fn convert_column_to_strings(&mut self, cname: &str) {
        let Some(old) = self.col_wips.get(cname) else {
            return;
        };
        let buf = old.as_bytes();
        let mut out = self.pool.get();
        let bloom = self
            .col_blooms
            .entry(cname.to_string())
            .or_insert_with(BloomIndex::with_default_size);
        let mut pos = 0;

        while pos < buf.len() {
            let (value, _, consumed) = match decode_value(&buf[pos..]) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(column = %cname, error = %e, "Undecodable value during consolidation");
                    out.extend_from_slice(&buf[pos..]);
                    break;
                }
            };
            match value {
                CValue::Unsigned(_) | CValue::Signed(_) | CValue::Float(_) => {
                    if let Some(n) = value.as_number() {
                        let rendered = n.to_string();
                        put_small_str(&mut out, cname, rendered.as_bytes());
                        bloom.add_to_bloom_both_cases(rendered.as_bytes());
                    }
                }
                CValue::Bool(b) => {
                    let rendered: &[u8] = if b { b"true" } else { b"false" };
                    put_small_str(&mut out, cname, rendered);
                    bloom.add_to_bloom_both_cases(rendered);
                }
                CValue::Str(_) | CValue::Backfill | CValue::DictArray(_) | CValue::RawJson(_) => {
                    out.extend_from_slice(&buf[pos..pos + consumed]);
                }
            }
            pos += consumed;
        }

        self.col_ranges.remove(cname);
        self.replace_column(cname, out);
    }

    /// Swap in a rewritten buffer and rebuild the column's dictionary from it.
    fn replace_column(&mut self, cname: &str, new_buf: Vec<u8>) {
        let Some(cw) = self.col_wips.get_mut(cname) else {
            self.pool.put(new_buf);
            return;
        };
        let old = std::mem::replace(&mut cw.buf, new_buf);
        self.pool.put(old);

        let abandoned = cw.dict.is_abandoned();
        cw.dict.clear();
        cw.last_record_start = 0;
        if abandoned {
            cw.dict.abandon();
            return;
        }
        let mut pos = 0;
        let mut rec_num: u16 = 0;
        while pos < cw.buf.len() {
            let Ok(len) = tlv_len(&cw.buf[pos..]) else {
                break;
            };
            cw.dict.check_add_dict_entry(&cw.buf[pos..pos + len], rec_num);
            cw.last_record_start = pos;
            pos += len;
            rec_num = rec_num.saturating_add(1);
        }
    }

    /// Encode the block's timestamps into `out`.
    pub fn encode_timestamps(&self, out: &mut Vec<u8>) {
        encode_timestamps(
            self.block_ts(),
            self.summary.low_ts,
            self.summary.high_ts,
            out,
        );
    }

    /// Prepare the block for the next batch of records of the same segment.
    ///
    /// Buffers keep their capacity unless the column count exceeds
    /// `col_wips_size_limit`, in which case they go back to the pool. Blooms
    /// are resized from their history; ranges, rollups and match bitmaps are
    /// cleared.
    pub fn reset(&mut self, col_wips_size_limit: usize) {
        self.max_idx = 0;
        if self.col_wips.len() > col_wips_size_limit {
            tracing::error!(
                columns = self.col_wips.len(),
                limit = col_wips_size_limit,
                "Column count above limit, releasing column buffers"
            );
            self.release_columns();
        } else {
            for cw in self.col_wips.values_mut() {
                cw.reset();
            }
        }

        for bloom in self.col_blooms.values_mut() {
            bloom.reset_for_next_block();
        }
        self.col_ranges.clear();
        self.summary.reset();
        self.columns_in_block.clear();
        for bitmap in self.pq_matches.values_mut() {
            bitmap.reset_all();
        }
        self.rollups.clear();
        self.block_ts.clear();
    }

    /// Return every column buffer to the pool.
    pub fn release_columns(&mut self) {
        for (_, cw) in self.col_wips.drain() {
            cw.release(&self.pool);
        }
    }

    pub(crate) fn clear_pq_matches(&mut self) {
        self.pq_matches.clear();
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
