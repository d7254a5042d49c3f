//! Writer Configuration
//!
//! This module defines configuration for the write path.
//!
//! ## WriterConfig
//!
//! Controls where segments live, when blocks are flushed and segments rotated,
//! and the cardinality ceilings that decide dictionary encoding and star-trees:
//!
//! - **data_path** / **host_id**: active and final segment directories are
//!   `<data_path><host_id>/{active,final}/<table>/<stream>/<suffix>/`
//! - **smr_base_dir**: directory holding the `segmeta.json` log
//! - **timestamp_key**: record field carrying the event time (default: `timestamp`)
//! - **max_seg_file_size**: rotate once on-disk bytes exceed this (default: 1 GiB)
//! - **seg_flush_interval_secs**: flush a WIP block idle for this long (default: 5s)
//! - **segment_rotate_duration_secs**: time-based rotation period (default: 15 min)
//! - **wip_card_limit**: dictionary-encoding ceiling per column (default: 501)
//! - **star_tree_card_limit**: ceiling for star-tree group-by columns (default: 250)
//!
//! ## Usage
//!
//! ```ignore
//! use loghouse_storage::WriterConfig;
//!
//! let config = WriterConfig {
//!     data_path: "/var/lib/loghouse/".to_string(),
//!     smr_base_dir: "/var/lib/loghouse/ingestnodes/node-1/".to_string(),
//!     host_id: "node-1".to_string(),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Shared byte budget across all column buffers of one WIP block.
pub const WIP_SIZE: usize = 2_000_000;
/// Initial record capacity of a block's timestamp array.
pub const WIP_NUM_RECS: usize = 4000;
/// Upper bound on the encoded size of one record.
pub const MAX_RECORD_SIZE: usize = 63_000;
/// Record numbers are persisted as u16, one value is held back as a sentinel.
pub const MAX_RECS_PER_WIP: u16 = 65_534;

pub const BLOOM_SIZE_HISTORY: usize = 5;
pub const BLOCK_BLOOM_SIZE: usize = 100;
pub const BOOL_BLOOM_SIZE: usize = 10;
pub const BLOOM_FP_RATE: f64 = 0.001;

pub const MS_IN_MIN: u64 = 60_000;
pub const MS_IN_HOUR: u64 = 3_600_000;
pub const MS_IN_DAY: u64 = 86_400_000;

/// Descriptor-limiter retries before a flush gives up.
pub const FD_ACQUIRE_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Root of the active/final segment trees (default: `data/`)
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Node identity, part of every segment path (default: `localhost`)
    #[serde(default = "default_host_id")]
    pub host_id: String,

    /// Directory of the segmeta log (default: `data/ingestnodes/localhost/`)
    #[serde(default = "default_smr_base_dir")]
    pub smr_base_dir: String,

    /// Field carrying the record timestamp (default: `timestamp`)
    #[serde(default = "default_timestamp_key")]
    pub timestamp_key: String,

    /// On-disk bytes after which a segment rotates (default: 1 GiB)
    #[serde(default = "default_max_seg_file_size")]
    pub max_seg_file_size: u64,

    /// Idle time after which a non-empty WIP block is flushed (default: 5s)
    #[serde(default = "default_seg_flush_interval_secs")]
    pub seg_flush_interval_secs: u64,

    /// Longest a record may wait in memory before a flush (default: 30s)
    #[serde(default = "default_max_wait_wip_flush_secs")]
    pub max_wait_wip_flush_secs: u64,

    /// Time-based rotation period (default: 900s)
    #[serde(default = "default_segment_rotate_duration_secs")]
    pub segment_rotate_duration_secs: u64,

    /// Build star-trees for persistent aggregations (default: true)
    #[serde(default = "default_true")]
    pub aggregations_enabled: bool,

    /// Trade throughput for memory (default: false)
    #[serde(default)]
    pub low_memory_mode: bool,

    /// Dictionary-encoding ceiling per column (default: 501)
    #[serde(default = "default_wip_card_limit")]
    pub wip_card_limit: u16,

    /// Cardinality ceiling for star-tree group-by columns (default: 250)
    #[serde(default = "default_star_tree_card_limit")]
    pub star_tree_card_limit: u64,

    /// Open segment stores allowed at once (default: 1000)
    #[serde(default = "default_max_allowed_seg_stores")]
    pub max_allowed_seg_stores: usize,

    /// Column buffers kept across blocks before they go back to the pool (default: 2000)
    #[serde(default = "default_col_wips_size_limit")]
    pub col_wips_size_limit: usize,

    /// Star-tree nodes that force a rotation (default: 8M)
    #[serde(default = "default_max_agile_tree_node_count")]
    pub max_agile_tree_node_count: usize,

    /// Star-tree builders alive at once (default: 5)
    #[serde(default = "default_max_concurrent_agile_trees")]
    pub max_concurrent_agile_trees: usize,

    /// Descriptors the flush path may hold at once (default: 10,000)
    #[serde(default = "default_max_open_fds")]
    pub max_open_fds: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            host_id: default_host_id(),
            smr_base_dir: default_smr_base_dir(),
            timestamp_key: default_timestamp_key(),
            max_seg_file_size: default_max_seg_file_size(),
            seg_flush_interval_secs: default_seg_flush_interval_secs(),
            max_wait_wip_flush_secs: default_max_wait_wip_flush_secs(),
            segment_rotate_duration_secs: default_segment_rotate_duration_secs(),
            aggregations_enabled: true,
            low_memory_mode: false,
            wip_card_limit: default_wip_card_limit(),
            star_tree_card_limit: default_star_tree_card_limit(),
            max_allowed_seg_stores: default_max_allowed_seg_stores(),
            col_wips_size_limit: default_col_wips_size_limit(),
            max_agile_tree_node_count: default_max_agile_tree_node_count(),
            max_concurrent_agile_trees: default_max_concurrent_agile_trees(),
            max_open_fds: default_max_open_fds(),
        }
    }
}

impl WriterConfig {
    /// Parse a JSON document, filling unspecified fields with defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the write path cannot honour.
    ///
    /// The dictionary ceiling must be at least twice the star-tree ceiling,
    /// since star-tree encodings reuse ingest dictionaries below it.
    pub fn validate(&self) -> Result<()> {
        if (self.wip_card_limit as u64) < 2 * self.star_tree_card_limit {
            return Err(Error::InvalidConfig(format!(
                "wip_card_limit {} must be >= 2 * star_tree_card_limit {}",
                self.wip_card_limit, self.star_tree_card_limit
            )));
        }
        if self.max_concurrent_agile_trees == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_agile_trees must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `<data_path><host_id>/active/`
    pub fn active_base_dir(&self) -> String {
        format!("{}{}/active/", self.data_path, self.host_id)
    }

    /// `<data_path><host_id>/final/`
    pub fn final_base_dir(&self) -> String {
        format!("{}{}/final/", self.data_path, self.host_id)
    }

    /// `<active_base_dir><table>/<stream_id>/<suffix>/`
    pub fn active_segment_dir(&self, table: &str, stream_id: &str, suffix: u64) -> String {
        format!("{}{}/{}/{}/", self.active_base_dir(), table, stream_id, suffix)
    }

    /// `<final_base_dir><table>/<stream_id>/<suffix>/`
    pub fn final_segment_dir(&self, table: &str, stream_id: &str, suffix: u64) -> String {
        format!("{}{}/{}/{}/", self.final_base_dir(), table, stream_id, suffix)
    }

    pub fn segmeta_path(&self) -> String {
        format!("{}segmeta.json", self.smr_base_dir)
    }

    pub fn seg_flush_interval(&self) -> Duration {
        Duration::from_secs(self.seg_flush_interval_secs)
    }

    pub fn segment_rotate_duration(&self) -> Duration {
        Duration::from_secs(self.segment_rotate_duration_secs)
    }
}

fn default_data_path() -> String {
    "data/".to_string()
}

fn default_host_id() -> String {
    "localhost".to_string()
}

fn default_smr_base_dir() -> String {
    "data/ingestnodes/localhost/".to_string()
}

fn default_timestamp_key() -> String {
    "timestamp".to_string()
}

fn default_max_seg_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_seg_flush_interval_secs() -> u64 {
    5
}

fn default_max_wait_wip_flush_secs() -> u64 {
    30
}

fn default_segment_rotate_duration_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

fn default_wip_card_limit() -> u16 {
    501
}

fn default_star_tree_card_limit() -> u64 {
    250
}

fn default_max_allowed_seg_stores() -> usize {
    1000
}

fn default_col_wips_size_limit() -> usize {
    2000
}

fn default_max_agile_tree_node_count() -> usize {
    8_000_000
}

fn default_max_concurrent_agile_trees() -> usize {
    5
}

fn default_max_open_fds() -> usize {
    10_000
}
