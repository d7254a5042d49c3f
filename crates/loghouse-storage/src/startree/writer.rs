//! Star-Tree Encoding
//!
//! ## `.strm` (metadata)
//!
//! ```text
//! [fileType=0x03][metaLen u32][meta][levelTable]
//!
//! meta:
//!   [numGroupBy u16] {[len u16][groupByCol]}*
//!   [numMeasures u16] {[len u16][measureCol]}*
//!   per group-by column:
//!     [len u16][cname][numKeys u32] {[len u16][encoded value]}*     dense id order
//!
//! levelTable: (numGroupBy + 1) x {[levelOffset i64][levelSize u32]}
//! ```
//!
//! ## `.strl` (levels)
//!
//! Levels are written breadth first starting at the root (level 0):
//!
//! ```text
//! [level u16][numNodes u32] {[nodeKey u32][ancestorKeys u32 x (level - 1)][agg 9B x numAggs]}*
//! ```
//!
//! Ancestor keys run from the parent upwards and stop below the root, so
//! levels 0 and 1 carry none. Each aggregate is `[dtype u8][value 8B]`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use loghouse_core::bytes_ext::put_u16_prefixed;
use loghouse_core::EncodingType;

use super::builder::StarTreeBuilder;
use super::node::NodeId;
use crate::error::{Error, Result};

pub fn strm_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.strm", segkey))
}

pub fn strl_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.strl", segkey))
}

impl StarTreeBuilder {
    /// Aggregate the tree and write `<segkey>.strm` and `<segkey>.strl`.
    ///
    /// A failed write removes the metadata file so no half-written tree is
    /// left behind.
    ///
    /// ## Returns
    ///
    /// Total bytes written across both files.
    pub fn encode_star_tree(&mut self, segkey: &str) -> Result<u64> {
        self.aggregate();

        let meta_path = strm_path(segkey);
        match self.write_files(&meta_path, &strl_path(segkey)) {
            Ok(written) => {
                tracing::debug!(
                    segkey = %segkey,
                    nodes = self.node_count(),
                    bytes = written,
                    "Encoded star-tree"
                );
                Ok(written)
            }
            Err(e) => {
                tracing::error!(segkey = %segkey, error = %e, "Star-tree encoding failed");
                let _ = fs::remove_file(&meta_path);
                Err(e)
            }
        }
    }

    fn write_files(&self, meta_path: &Path, levels_path: &Path) -> Result<u64> {
        let num_levels = self.group_by_keys.len() + 1;
        let mut level_offsets = vec![0i64; num_levels];
        let mut level_sizes = vec![0u32; num_levels];

        let levels = self.encode_levels(&mut level_offsets, &mut level_sizes)?;
        File::create(levels_path)?.write_all(&levels)?;

        let mut meta = Vec::new();
        meta.put_u8(EncodingType::StarTreeBlock.as_byte());
        meta.put_u32_le(0);
        self.encode_metadata(&mut meta)?;
        let meta_len = (meta.len() - 5) as u32;
        meta[1..5].copy_from_slice(&meta_len.to_le_bytes());
        for (off, size) in level_offsets.iter().zip(&level_sizes) {
            meta.put_i64_le(*off);
            meta.put_u32_le(*size);
        }
        File::create(meta_path)?.write_all(&meta)?;

        Ok((meta.len() + levels.len()) as u64)
    }

    fn encode_metadata(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u16_le(self.group_by_keys.len() as u16);
        for key in &self.group_by_keys {
            put_u16_prefixed(buf, key.as_bytes())?;
        }
        buf.put_u16_le(self.measure_cols.len() as u16);
        for mcol in &self.measure_cols {
            put_u16_prefixed(buf, mcol.as_bytes())?;
        }
        for (cname, rev) in self.group_by_keys.iter().zip(&self.seg_dict_enc_rev) {
            put_u16_prefixed(buf, cname.as_bytes())?;
            buf.put_u32_le(rev.len() as u32);
            for value in rev {
                put_u16_prefixed(buf, value)?;
            }
        }
        Ok(())
    }

    fn encode_levels(&self, offsets: &mut [i64], sizes: &mut [u32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut current: Vec<NodeId> = vec![self.root];
        let mut level = 0usize;

        while !current.is_empty() {
            if level >= offsets.len() {
                return Err(Error::StarTree(format!(
                    "tree deeper than {} group-by levels",
                    offsets.len() - 1
                )));
            }
            let start = out.len();
            offsets[level] = start as i64;
            out.put_u16_le(level as u16);
            out.put_u32_le(current.len() as u32);

            let mut next = Vec::new();
            for &id in &current {
                let node = self.arena.get(id);
                next.extend(node.children.values().copied());
                out.put_u32_le(node.key);

                let mut ancestor = node.parent;
                for _ in 1..level {
                    let Some(aid) = ancestor else {
                        return Err(Error::StarTree(format!(
                            "node {} at level {} is missing an ancestor",
                            node.key, level
                        )));
                    };
                    let anode = self.arena.get(aid);
                    out.put_u32_le(anode.key);
                    ancestor = anode.parent;
                }
                if level > 0 && ancestor != Some(self.root) {
                    tracing::error!(level, node_key = node.key, "Ancestor walk did not end at the root");
                }

                for value in &node.agg_values {
                    value.put(&mut out);
                }
            }

            sizes[level] = (out.len() - start) as u32;
            current = next;
            level += 1;
        }
        Ok(out)
    }
}
