//! Star-tree construction over WIP blocks.

use std::collections::HashMap;

use loghouse_core::{decode_value, tlv_len, CValue, ValueTag};

use super::node::{
    AggFn, AggValue, NodeArena, NodeId, MEAS_FN_COUNT, MEAS_FN_MAX, MEAS_FN_MIN, MEAS_FN_SUM,
    TOTAL_MEAS_FNS,
};
use super::ROOT_KEY;
use crate::colwip::ColWip;
use crate::error::Result;
use crate::wip::WipBlock;

const BACKFILL_WORD: [u8; 1] = [ValueTag::Backfill as u8];

/// Result of folding one block into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome {
    Built,
    /// A group-by column passed the cardinality ceiling; the tree must be
    /// dropped for the rest of the segment.
    CardinalityExceeded { column: String },
}

/// Builds one star-tree, reusing its node arena and dictionaries across
/// segments.
#[derive(Debug)]
pub struct StarTreeBuilder {
    pub(super) group_by_keys: Vec<String>,
    pub(super) measure_cols: Vec<String>,
    card_limit: u64,
    pub(super) arena: NodeArena,
    pub(super) root: NodeId,
    /// Per group-by column: encoded value -> dense id
    seg_dict_map: Vec<HashMap<Vec<u8>, u32>>,
    /// Per group-by column: dense id -> encoded value
    pub(super) seg_dict_enc_rev: Vec<Vec<Vec<u8>>>,
    rec_enc: Vec<Vec<u32>>,
    rec_meas: Vec<Vec<AggValue>>,
}

impl Default for StarTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StarTreeBuilder {
    pub fn new() -> Self {
        let mut arena = NodeArena::default();
        let root = arena.alloc(ROOT_KEY, None, 0);
        Self {
            group_by_keys: Vec::new(),
            measure_cols: Vec::new(),
            card_limit: u64::MAX,
            arena,
            root,
            seg_dict_map: Vec::new(),
            seg_dict_enc_rev: Vec::new(),
            rec_enc: Vec::new(),
            rec_meas: Vec::new(),
        }
    }

    /// Start a new, empty tree.
    ///
    /// ## Arguments
    ///
    /// - `group_by_keys`: one tree level per column, in this order
    /// - `measure_cols`: columns aggregated at every node
    /// - `card_limit`: distinct values a group-by column may reach before the
    ///   tree is abandoned
    pub fn reset_seg_tree(
        &mut self,
        group_by_keys: Vec<String>,
        measure_cols: Vec<String>,
        card_limit: u64,
    ) {
        let num_aggs = measure_cols.len() * TOTAL_MEAS_FNS;
        let num_cols = group_by_keys.len();
        self.group_by_keys = group_by_keys;
        self.measure_cols = measure_cols;
        self.card_limit = card_limit;

        self.arena.reset();
        self.root = self.arena.alloc(ROOT_KEY, None, num_aggs);

        self.seg_dict_map.resize_with(num_cols, HashMap::new);
        self.seg_dict_map.truncate(num_cols);
        self.seg_dict_enc_rev.resize_with(num_cols, Vec::new);
        self.seg_dict_enc_rev.truncate(num_cols);
        self.rec_enc.resize_with(num_cols, Vec::new);
        self.rec_enc.truncate(num_cols);
        for (map, rev) in self.seg_dict_map.iter_mut().zip(self.seg_dict_enc_rev.iter_mut()) {
            map.clear();
            rev.clear();
        }
        self.rec_meas.resize_with(self.measure_cols.len(), Vec::new);
        self.rec_meas.truncate(self.measure_cols.len());
    }

    pub fn group_by_keys(&self) -> &[String] {
        &self.group_by_keys
    }

    pub fn measure_cols(&self) -> &[String] {
        &self.measure_cols
    }

    /// Nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    /// Distinct values seen so far per group-by column.
    pub fn each_col_distinct_count(&self) -> HashMap<String, u32> {
        self.group_by_keys
            .iter()
            .zip(&self.seg_dict_enc_rev)
            .map(|(k, rev)| (k.clone(), rev.len() as u32))
            .collect()
    }

    /// Aggregate slots of the root, `TOTAL_MEAS_FNS` per measure column.
    ///
    /// Only meaningful after [`StarTreeBuilder::aggregate`].
    pub fn root_agg_values(&self) -> &[AggValue] {
        &self.arena.get(self.root).agg_values
    }

    /// Root aggregate of `measure` for the slot `meas_fn` (`MEAS_FN_*`).
    pub fn root_agg(&self, measure: &str, meas_fn: usize) -> Option<AggValue> {
        let idx = self.measure_cols.iter().position(|m| m == measure)?;
        self.root_agg_values()
            .get(idx * TOTAL_MEAS_FNS + meas_fn)
            .copied()
    }

    /// Insert every record of `wip` into the tree.
    ///
    /// Group-by values are dictionary-encoded first, so the ceiling check
    /// runs before any node is created for this block.
    pub fn compute_star_tree(&mut self, wip: &WipBlock) -> Result<ComputeOutcome> {
        let num_recs = wip.rec_count() as usize;

        if let Some(column) = self.create_encodings(wip, num_recs)? {
            return Ok(ComputeOutcome::CardinalityExceeded { column });
        }
        self.extract_measures(wip, num_recs)?;
        self.build_tree_structure(num_recs);

        Ok(ComputeOutcome::Built)
    }

    fn set_col_val_enc(&mut self, col_num: usize, value: &[u8]) -> u32 {
        if let Some(&enc) = self.seg_dict_map[col_num].get(value) {
            return enc;
        }
        let enc = self.seg_dict_enc_rev[col_num].len() as u32;
        self.seg_dict_map[col_num].insert(value.to_vec(), enc);
        self.seg_dict_enc_rev[col_num].push(value.to_vec());
        enc
    }

    /// Returns the first column over the ceiling, if any.
    fn create_encodings(&mut self, wip: &WipBlock, num_recs: usize) -> Result<Option<String>> {
        for col_num in 0..self.group_by_keys.len() {
            self.rec_enc[col_num].clear();
            self.rec_enc[col_num].resize(num_recs, 0);

            match wip.col_wips.get(&self.group_by_keys[col_num]) {
                None => {
                    let enc = self.set_col_val_enc(col_num, &BACKFILL_WORD);
                    self.rec_enc[col_num].iter_mut().for_each(|e| *e = enc);
                }
                Some(cw) if cw.dict().is_usable() => {
                    for (word, recs) in cw.dict().entries() {
                        let enc = self.set_col_val_enc(col_num, word);
                        for &rec in recs {
                            if let Some(slot) = self.rec_enc[col_num].get_mut(rec as usize) {
                                *slot = enc;
                            }
                        }
                    }
                }
                Some(cw) => {
                    let buf = cw.as_bytes();
                    let mut pos = 0;
                    for rec in 0..num_recs {
                        let len = tlv_len(&buf[pos..])?;
                        let enc = self.set_col_val_enc(col_num, &buf[pos..pos + len]);
                        self.rec_enc[col_num][rec] = enc;
                        pos += len;
                    }
                }
            }

            if self.seg_dict_enc_rev[col_num].len() as u64 > self.card_limit {
                return Ok(Some(self.group_by_keys[col_num].clone()));
            }
        }
        Ok(None)
    }

    fn extract_measures(&mut self, wip: &WipBlock, num_recs: usize) -> Result<()> {
        for (m_num, mname) in self.measure_cols.iter().enumerate() {
            let vals = &mut self.rec_meas[m_num];
            vals.clear();
            vals.resize(num_recs, AggValue::Empty);
            if let Some(cw) = wip.col_wips.get(mname) {
                fill_measure_values(cw, vals)?;
            }
        }
        Ok(())
    }

    fn build_tree_structure(&mut self, num_recs: usize) {
        let num_aggs = self.measure_cols.len() * TOTAL_MEAS_FNS;

        for rec in 0..num_recs {
            let mut node = self.root;
            for col_num in 0..self.group_by_keys.len() {
                let key = self.rec_enc[col_num][rec];
                let existing = self.arena.get(node).children.get(&key).copied();
                node = match existing {
                    Some(child) => child,
                    None => {
                        let child = self.arena.alloc(key, Some(node), num_aggs);
                        self.arena.get_mut(node).children.insert(key, child);
                        child
                    }
                };
            }

            let leaf = self.arena.get_mut(node);
            for (m_num, vals) in self.rec_meas.iter().enumerate() {
                let val = vals[rec];
                if val == AggValue::Empty {
                    continue;
                }
                let base = m_num * TOTAL_MEAS_FNS;
                leaf.agg_values[base + MEAS_FN_MIN].reduce(val, AggFn::Min);
                leaf.agg_values[base + MEAS_FN_MAX].reduce(val, AggFn::Max);
                leaf.agg_values[base + MEAS_FN_SUM].reduce(val, AggFn::Sum);
                leaf.agg_values[base + MEAS_FN_COUNT].reduce(AggValue::Int(1), AggFn::Count);
            }
        }
    }

    /// Fill every internal node with the reduction of its children.
    ///
    /// Internal nodes are recomputed from scratch, so calling this more than
    /// once gives the same result.
    pub fn aggregate(&mut self) {
        self.aggregate_node(self.root);
    }

    fn aggregate_node(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.arena.get(id).children.values().copied().collect();
        let Some((&first, rest)) = children.split_first() else {
            return;
        };
        for &child in &children {
            self.aggregate_node(child);
        }

        let mut acc = self.arena.get(first).agg_values.clone();
        for &child in rest {
            let vals = &self.arena.get(child).agg_values;
            for (i, slot) in acc.iter_mut().enumerate() {
                slot.reduce(vals[i], agg_fn_for_slot(i));
            }
        }
        self.arena.get_mut(id).agg_values = acc;
    }
}

fn agg_fn_for_slot(i: usize) -> AggFn {
    match i % TOTAL_MEAS_FNS {
        MEAS_FN_MIN => AggFn::Min,
        MEAS_FN_MAX => AggFn::Max,
        MEAS_FN_SUM => AggFn::Sum,
        _ => AggFn::Count,
    }
}

fn to_agg_value(v: &CValue) -> AggValue {
    match *v {
        CValue::Unsigned(u) => match i64::try_from(u) {
            Ok(i) => AggValue::Int(i),
            Err(_) => AggValue::Float(u as f64),
        },
        CValue::Signed(i) => AggValue::Int(i),
        CValue::Float(f) => AggValue::Float(f),
        _ => AggValue::Empty,
    }
}

/// Numeric value of every record of `cw`; non-numeric records stay empty.
fn fill_measure_values(cw: &ColWip, vals: &mut [AggValue]) -> Result<()> {
    if cw.dict().is_usable() {
        for (word, recs) in cw.dict().entries() {
            let (value, _, _) = decode_value(word)?;
            let agg = to_agg_value(&value);
            for &rec in recs {
                if let Some(slot) = vals.get_mut(rec as usize) {
                    *slot = agg;
                }
            }
        }
        return Ok(());
    }

    let buf = cw.as_bytes();
    let mut pos = 0;
    for slot in vals.iter_mut() {
        if pos >= buf.len() {
            break;
        }
        let (value, _, consumed) = decode_value(&buf[pos..])?;
        *slot = to_agg_value(&value);
        pos += consumed;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use loghouse_core::BufferPool;
    use serde_json::json;

    use crate::query::PqColumnTracker;
    use crate::segstats::SegStatsMap;
    use crate::wip::{EncodeContext, SeenColumns, SignalType};

    fn block_of(records: &[serde_json::Value], dict_ceiling: u16) -> WipBlock {
        let mut wip = WipBlock::new(Arc::new(BufferPool::new(256, 4)), dict_ceiling);
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
            let (max_idx, _) = wip.encode_columns(&raw, i as u64, &mut ctx).unwrap();
            wip.commit_record(max_idx);
        }
        wip
    }

    fn sample() -> Vec<serde_json::Value> {
        vec![
            json!({"os": "linux", "region": "eu", "lat": 10}),
            json!({"os": "linux", "region": "us", "lat": 30}),
            json!({"os": "mac", "region": "eu", "lat": 5}),
            json!({"os": "linux", "region": "eu", "lat": 2.5}),
            json!({"os": "mac", "region": "eu"}),
        ]
    }

    fn check_sample(stb: &mut StarTreeBuilder) {
        stb.aggregate();
        assert_eq!(stb.root_agg("lat", MEAS_FN_SUM), Some(AggValue::Float(47.5)));
        assert_eq!(stb.root_agg("lat", MEAS_FN_MIN), Some(AggValue::Float(2.5)));
        assert_eq!(stb.root_agg("lat", MEAS_FN_MAX), Some(AggValue::Float(30.0)));
        assert_eq!(stb.root_agg("lat", MEAS_FN_COUNT), Some(AggValue::Int(4)));
        // root + 2 os + 3 (os, region) pairs
        assert_eq!(stb.node_count(), 6);
        let counts = stb.each_col_distinct_count();
        assert_eq!(counts["os"], 2);
        assert_eq!(counts["region"], 2);
    }

    #[test]
    fn test_dictionary_and_raw_encodings_agree() {
        for ceiling in [501, 1] {
            let wip = block_of(&sample(), ceiling);
            let mut stb = StarTreeBuilder::new();
            stb.reset_seg_tree(
                vec!["os".to_string(), "region".to_string()],
                vec!["lat".to_string()],
                250,
            );
            assert_eq!(stb.compute_star_tree(&wip).unwrap(), ComputeOutcome::Built);
            check_sample(&mut stb);
        }
    }

    #[test]
    fn test_aggregate_is_repeatable() {
        let wip = block_of(&sample(), 501);
        let mut stb = StarTreeBuilder::new();
        stb.reset_seg_tree(vec!["os".to_string()], vec!["lat".to_string()], 250);
        stb.compute_star_tree(&wip).unwrap();
        stb.aggregate();
        let first = stb.root_agg_values().to_vec();
        stb.aggregate();
        assert_eq!(stb.root_agg_values(), first.as_slice());
    }

    #[test]
    fn test_cardinality_ceiling_drops_tree() {
        let wip = block_of(&sample(), 501);
        let mut stb = StarTreeBuilder::new();
        stb.reset_seg_tree(vec!["lat".to_string()], vec![], 3);
        assert_eq!(
            stb.compute_star_tree(&wip).unwrap(),
            ComputeOutcome::CardinalityExceeded {
                column: "lat".to_string()
            }
        );
    }

    #[test]
    fn test_missing_group_by_column_groups_as_backfill() {
        let wip = block_of(&sample(), 501);
        let mut stb = StarTreeBuilder::new();
        stb.reset_seg_tree(vec!["absent".to_string()], vec!["lat".to_string()], 250);
        stb.compute_star_tree(&wip).unwrap();
        assert_eq!(stb.node_count(), 2);
        assert_eq!(stb.seg_dict_enc_rev[0], vec![BACKFILL_WORD.to_vec()]);
    }
}
