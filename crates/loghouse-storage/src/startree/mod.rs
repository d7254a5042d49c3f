//! Star-Tree Aggregation Index
//!
//! A star-tree pre-aggregates the records of a segment by a fixed list of
//! group-by columns so aggregation queries over those columns can be answered
//! from the tree instead of the raw column files.
//!
//! ## Shape
//!
//! ```text
//!                    root (key u32::MAX)
//!                 /         |          \
//!   level 1:   a=enc0     a=enc1     a=enc2        one level per group-by column
//!               /   \        |          |
//!   level 2:  d=0   d=1     d=0        d=0         leaves hold measure aggregates
//! ```
//!
//! Group-by values are re-encoded into dense per-column integers
//! (`0..distinct`) for this tree only. Every node carries, per measure column,
//! `min`, `max`, `sum` and `count` slots. Leaves accumulate while records are
//! inserted; internal nodes are filled by [`StarTreeBuilder::aggregate`] just
//! before encoding.
//!
//! ## Lifecycle
//!
//! Builders come from a [`StarTreePool`] bounded by the configured number of
//! concurrent trees. A segment store resets its builder on the first block,
//! inserts each later block's records cumulatively, and writes the tree once
//! at rotation. When a group-by column grows past the cardinality ceiling the
//! whole tree is dropped for the rest of the segment.
//!
//! ## Files
//!
//! - `<segkey>.strm`: `[0x03][metaLen u32][meta][levelOffsets]`
//! - `<segkey>.strl`: breadth-first level records
//!
//! See [`writer`] for the byte layout.

mod builder;
mod node;
mod pool;
pub mod writer;

pub use builder::{ComputeOutcome, StarTreeBuilder};
pub use node::{
    AggValue, NodeId, MEAS_FN_COUNT, MEAS_FN_MAX, MEAS_FN_MIN, MEAS_FN_SUM, TOTAL_MEAS_FNS,
};
pub use pool::{PooledBuilder, StarTreePool};
pub use writer::{strl_path, strm_path};

/// Key of the root node.
pub const ROOT_KEY: u32 = u32::MAX;
