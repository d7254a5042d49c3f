//! Loghouse Storage - Columnar Segment Writer
//!
//! This crate is the write path of loghouse: it turns JSON log and trace
//! records into columnar segment files with micro-indices, segment
//! statistics and optional pre-aggregated star-trees, then rotates finished
//! segments to their final location and records them in the segment
//! metadata log.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐
//! │  Ingest callers  │
//! └────────┬─────────┘
//!          │ (stream, record, ts)
//!          ▼
//! ┌──────────────────┐      idle flush / time rotation / pruning
//! │ SegStoreRegistry │ ◄─── tokio background loops
//! └────────┬─────────┘
//!          │ one per stream
//!          ▼
//! ┌──────────────────┐
//! │    SegStore      │  WIP block, seg stats, star-tree
//! │  - encode        │
//! │  - flush block   │──► .csg .cmi .bsu .sst .sid .pqmr .crup
//! │  - rotate        │──► .strm .strl, rename, segmeta.json
//! └──────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### WipBlock
//! Holds one block of records column by column. Every column buffer carries
//! one TLV value per record (backfilled where a record lacks the column),
//! a dictionary while the column stays under the cardinality ceiling, and
//! a bloom or range index. Mixed string/number columns are consolidated
//! before the block is flushed.
//!
//! ### SegStore
//! Owns the segment of one stream. Flushes compress every column in
//! parallel, append the block to the column files and write the block
//! summary, statistics and persistent-query matches. Rotation renames the
//! active directory in one step and appends the segment's [`SegMeta`].
//!
//! ### StarTreeBuilder
//! Groups the records of a segment by the persistent aggregation's group-by
//! columns and keeps min/max/sum/count of every measure at every node.
//!
//! ### SegMetaLog
//! Line-oriented JSON log of every rotated segment, with `.sfm` side files
//! and recovery of rotations that died before their log append.
//!
//! ## Usage Example
//!
//! ```ignore
//! use loghouse_storage::{SegStoreRegistry, SignalType, WriterConfig, WriterEnv};
//!
//! let env = WriterEnv::new(WriterConfig::default())?;
//! let registry = Arc::new(SegStoreRegistry::new(env));
//! Arc::clone(&registry).start_background_flush(Duration::from_secs(1));
//!
//! let raw = br#"{"timestamp":1700000000000,"level":"info","msg":"started"}"#;
//! registry.add_entry("stream-1", "logs", 0, raw, 1_700_000_000_000, raw.len() as u64, false, SignalType::Events)?;
//!
//! registry.shutdown();
//! ```

pub mod blob;
pub mod blocksummary;
pub mod bloom;
pub mod colwip;
pub mod config;
pub mod csg;
pub mod dict;
pub mod env;
pub mod error;
pub mod fdlimit;
pub mod fileutils;
pub mod hll;
pub mod microindex;
pub mod pqmr;
pub mod query;
pub mod range;
pub mod registry;
pub mod segmeta;
pub mod segstats;
pub mod segstore;
pub mod startree;
pub mod suffix;
pub mod timestamp;
pub mod unrotated;
pub mod wip;

pub use blob::{BlobUploader, NoopUploader};
pub use blocksummary::{BlockMetadataHolder, BlockSummary};
pub use bloom::BloomIndex;
pub use config::WriterConfig;
pub use dict::{DictBlockReader, DictEncoder};
pub use env::{WriterEnv, WriterEnvBuilder};
pub use error::{Error, Result};
pub use fdlimit::{FdLimiter, FdPermit};
pub use query::{
    ColumnPresenceSearch, NoopQueryProvider, PersistentAggs, PersistentQueryProvider, PqQuery,
    StaticQueryProvider, StreamingSearch,
};
pub use range::{NumRange, RangeIndex};
pub use registry::SegStoreRegistry;
pub use segmeta::{SegFullMeta, SegMeta, SegMetaLog};
pub use segstats::{SegStats, SegStatsMap};
pub use segstore::{SegStore, StoreOptions};
pub use startree::{ComputeOutcome, StarTreeBuilder, StarTreePool};
pub use suffix::{FileSuffixGenerator, SuffixGenerator};
pub use unrotated::UnrotatedRegistry;
pub use wip::{SignalType, WipBlock};
