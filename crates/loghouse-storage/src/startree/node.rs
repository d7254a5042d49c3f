//! Node arena for star-tree builders.
//!
//! Nodes live in one `Vec` and refer to each other by index. The arena is
//! reused across trees: [`NodeArena::reset`] only rewinds the length, and
//! slots are reinitialized when handed out again.

use std::collections::BTreeMap;

use bytes::BufMut;
use loghouse_core::SegDtype;

pub const MEAS_FN_MIN: usize = 0;
pub const MEAS_FN_MAX: usize = 1;
pub const MEAS_FN_SUM: usize = 2;
pub const MEAS_FN_COUNT: usize = 3;
/// Aggregate slots per measure column.
pub const TOTAL_MEAS_FNS: usize = 4;

pub type NodeId = usize;

/// One aggregate slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AggValue {
    /// Nothing folded in yet
    #[default]
    Empty,
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggFn {
    Min,
    Max,
    Sum,
    Count,
}

impl AggValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            AggValue::Empty => None,
            AggValue::Int(i) => Some(i as f64),
            AggValue::Float(f) => Some(f),
        }
    }

    /// Fold `other` into `self`. An empty side takes the other side as is;
    /// an int meeting a float becomes a float.
    pub(crate) fn reduce(&mut self, other: AggValue, func: AggFn) {
        *self = match (*self, other) {
            (_, AggValue::Empty) => return,
            (AggValue::Empty, v) => v,
            (AggValue::Int(a), AggValue::Int(b)) => AggValue::Int(match func {
                AggFn::Min => a.min(b),
                AggFn::Max => a.max(b),
                AggFn::Sum | AggFn::Count => a.wrapping_add(b),
            }),
            (a, b) => {
                let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                AggValue::Float(match func {
                    AggFn::Min => a.min(b),
                    AggFn::Max => a.max(b),
                    AggFn::Sum | AggFn::Count => a + b,
                })
            }
        };
    }

    /// Append `[dtype u8][value 8B]`; empty slots carry the backfill type
    /// and zero bytes.
    pub(crate) fn put<B: BufMut>(self, buf: &mut B) {
        match self {
            AggValue::Empty => {
                buf.put_u8(SegDtype::Backfill.as_byte());
                buf.put_u64_le(0);
            }
            AggValue::Int(i) => {
                buf.put_u8(SegDtype::SignedNum.as_byte());
                buf.put_i64_le(i);
            }
            AggValue::Float(f) => {
                buf.put_u8(SegDtype::Float.as_byte());
                buf.put_f64_le(f);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub(crate) key: u32,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: BTreeMap<u32, NodeId>,
    pub(crate) agg_values: Vec<AggValue>,
}

#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
    len: usize,
}

impl NodeArena {
    /// Hand out a node with no children and `num_aggs` empty slots.
    pub(crate) fn alloc(&mut self, key: u32, parent: Option<NodeId>, num_aggs: usize) -> NodeId {
        if self.len == self.nodes.len() {
            self.nodes.push(Node::default());
        }
        let id = self.len;
        let node = &mut self.nodes[id];
        node.key = key;
        node.parent = parent;
        node.children.clear();
        node.agg_values.clear();
        node.agg_values.resize(num_aggs, AggValue::Empty);
        self.len += 1;
        id
    }

    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_promotes_to_float() {
        let mut v = AggValue::Empty;
        v.reduce(AggValue::Int(3), AggFn::Sum);
        assert_eq!(v, AggValue::Int(3));
        v.reduce(AggValue::Empty, AggFn::Sum);
        assert_eq!(v, AggValue::Int(3));
        v.reduce(AggValue::Float(0.5), AggFn::Sum);
        assert_eq!(v, AggValue::Float(3.5));

        let mut m = AggValue::Int(7);
        m.reduce(AggValue::Int(-2), AggFn::Min);
        assert_eq!(m, AggValue::Int(-2));
        m.reduce(AggValue::Int(9), AggFn::Max);
        assert_eq!(m, AggValue::Int(9));
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = NodeArena::default();
        let root = arena.alloc(u32::MAX, None, 4);
        let child = arena.alloc(0, Some(root), 4);
        arena.get_mut(root).children.insert(0, child);
        arena.get_mut(child).agg_values[0] = AggValue::Int(5);
        assert_eq!(arena.len(), 2);

        arena.reset();
        let again = arena.alloc(1, None, 8);
        assert_eq!(again, 0);
        assert!(arena.get(again).children.is_empty());
        assert_eq!(arena.get(again).agg_values.len(), 8);
        let next = arena.alloc(2, Some(again), 8);
        assert_eq!(arena.get(next).agg_values[0], AggValue::Empty);
    }

    #[test]
    fn test_agg_value_layout() {
        let mut buf = Vec::new();
        AggValue::Int(34).put(&mut buf);
        AggValue::Empty.put(&mut buf);
        assert_eq!(buf.len(), 18);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 34);
        assert_eq!(buf[9], 7);
    }
}
