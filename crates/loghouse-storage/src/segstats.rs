//! Segment Statistics
//!
//! Running per-column statistics over a whole segment: a value count, a
//! HyperLogLog cardinality sketch and, for numeric columns, min/max/sum.
//!
//! ## Numeric Promotion
//!
//! Min, max and sum start as signed integers (`i64::MAX`, `i64::MIN`, `0`).
//! The first float value promotes all three to floats; later integers are
//! cast. Unsigned values are folded in as `i64`.
//!
//! ## File Layout
//!
//! The `.sst` file is rewritten in full on every block flush:
//!
//! ```text
//! [version=1]
//! { [cnameLen u16][cname][encLen u32]
//!   [isNumeric u8][count u64][hllSize u32][hll]
//!   ([ntype u8][value 8B]) x 3      only when numeric: min, max, sum
//! }*
//! ```
//!
//! `encLen` counts the bytes after itself for that column. `ntype` is
//! 2 (signed) or 4 (float).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use loghouse_core::bytes_ext::{patch_u32, put_u16_prefixed, LeReader};
use loghouse_core::{Number, SegDtype};

use crate::error::{Error, Result};
use crate::hll::HyperLogLog;

const SST_VERSION: u8 = 1;

/// A statistic that is an integer until a float shows up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatNum {
    Int(i64),
    Float(f64),
}

impl StatNum {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn dtype(self) -> SegDtype {
        match self {
            Self::Int(_) => SegDtype::SignedNum,
            Self::Float(_) => SegDtype::Float,
        }
    }

    fn put<B: BufMut>(self, buf: &mut B) {
        buf.put_u8(self.dtype().as_byte());
        match self {
            Self::Int(i) => buf.put_i64_le(i),
            Self::Float(f) => buf.put_f64_le(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumericStats {
    pub min: StatNum,
    pub max: StatNum,
    pub sum: StatNum,
}

impl Default for NumericStats {
    fn default() -> Self {
        Self {
            min: StatNum::Int(i64::MAX),
            max: StatNum::Int(i64::MIN),
            sum: StatNum::Int(0),
        }
    }
}

impl NumericStats {
    fn fold(&mut self, n: Number) {
        let all_int = matches!(self.sum, StatNum::Int(_)) && !n.is_float();
        if all_int {
            let v = match n {
                Number::Unsigned(u) => u as i64,
                Number::Signed(i) => i,
                Number::Float(f) => f as i64,
            };
            if let (StatNum::Int(min), StatNum::Int(max), StatNum::Int(sum)) =
                (self.min, self.max, self.sum)
            {
                self.min = StatNum::Int(min.min(v));
                self.max = StatNum::Int(max.max(v));
                self.sum = StatNum::Int(sum.wrapping_add(v));
            }
            return;
        }

        let v = n.as_f64();
        self.min = StatNum::Float(self.min.as_f64().min(v));
        self.max = StatNum::Float(self.max.as_f64().max(v));
        self.sum = StatNum::Float(self.sum.as_f64() + v);
    }
}

/// Statistics of one column over the segment.
#[derive(Debug, Clone, Default)]
pub struct SegStats {
    pub is_numeric: bool,
    pub count: u64,
    pub hll: HyperLogLog,
    pub num_stats: Option<NumericStats>,
}

impl SegStats {
    pub fn add_str(&mut self, value: &[u8]) {
        self.count += 1;
        self.hll.insert(value);
    }

    pub fn add_number(&mut self, n: Number) {
        self.count += 1;
        self.hll.insert(n.to_string().as_bytes());
        self.is_numeric = true;
        let stats = self.num_stats.get_or_insert_with(NumericStats::default);
        stats.fold(n);
    }

    pub fn cardinality(&self) -> u64 {
        self.hll.estimate()
    }
}

/// Column name to statistics, ordered for stable `.sst` output.
pub type SegStatsMap = BTreeMap<String, SegStats>;

pub fn add_seg_stats_str(stats: &mut SegStatsMap, cname: &str, value: &[u8]) {
    match stats.get_mut(cname) {
        Some(s) => s.add_str(value),
        None => {
            let mut s = SegStats::default();
            s.add_str(value);
            stats.insert(cname.to_string(), s);
        }
    }
}

pub fn add_seg_stats_num(stats: &mut SegStatsMap, cname: &str, value: Number) {
    match stats.get_mut(cname) {
        Some(s) => s.add_number(value),
        None => {
            let mut s = SegStats::default();
            s.add_number(value);
            stats.insert(cname.to_string(), s);
        }
    }
}

/// Encode every column's statistics, see the module docs for the layout.
pub fn encode_seg_stats(stats: &SegStatsMap) -> Result<Vec<u8>> {
    if stats.is_empty() {
        return Err(Error::NoSegStats);
    }
    let mut buf = Vec::new();
    buf.put_u8(SST_VERSION);
    for (cname, sst) in stats {
        put_u16_prefixed(&mut buf, cname.as_bytes())?;
        let len_at = buf.len();
        buf.put_u32_le(0);

        let is_numeric = sst.is_numeric && sst.num_stats.is_some();
        buf.put_u8(is_numeric as u8);
        buf.put_u64_le(sst.count);
        let hll = sst.hll.to_bytes();
        buf.put_u32_le(hll.len() as u32);
        buf.put_slice(&hll);
        if let Some(ns) = sst.num_stats.as_ref().filter(|_| is_numeric) {
            ns.min.put(&mut buf);
            ns.max.put(&mut buf);
            ns.sum.put(&mut buf);
        }
        let enc_len = buf.len() - len_at - 4;
        patch_u32(&mut buf, len_at, enc_len as u32);
    }
    Ok(buf)
}

pub fn sst_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.sst", segkey))
}

/// Rewrite `<segkey>.sst` with the current statistics.
pub fn flush_seg_stats(path: &Path, stats: &SegStatsMap) -> Result<usize> {
    let buf = encode_seg_stats(stats)?;
    let mut fd = File::create(path)?;
    fd.write_all(&buf)?;
    Ok(buf.len())
}

fn read_stat_num(r: &mut LeReader<'_>) -> Result<StatNum> {
    let ntype = r.u8()?;
    match SegDtype::from_byte(ntype) {
        Some(SegDtype::Float) => Ok(StatNum::Float(r.f64()?)),
        Some(SegDtype::SignedNum) => Ok(StatNum::Int(r.i64()?)),
        _ => Err(Error::MalformedRecord(format!("unknown stat type {}", ntype))),
    }
}

/// Decode a `.sst` buffer.
pub fn decode_seg_stats(data: &[u8]) -> Result<SegStatsMap> {
    let mut r = LeReader::new(data);
    let version = r.u8()?;
    if version != SST_VERSION {
        return Err(Error::MalformedRecord(format!(
            "unsupported segstats version {}",
            version
        )));
    }
    let mut out = SegStatsMap::new();
    while !r.is_empty() {
        let cname = String::from_utf8_lossy(r.u16_prefixed()?).into_owned();
        let enc_len = r.u32()? as usize;
        let mut er = LeReader::new(r.take(enc_len)?);
        let is_numeric = er.u8()? != 0;
        let count = er.u64()?;
        let hll_len = er.u32()? as usize;
        let hll = HyperLogLog::from_bytes(er.take(hll_len)?)?;
        let num_stats = if is_numeric {
            Some(NumericStats {
                min: read_stat_num(&mut er)?,
                max: read_stat_num(&mut er)?,
                sum: read_stat_num(&mut er)?,
            })
        } else {
            None
        };
        out.insert(
            cname,
            SegStats {
                is_numeric,
                count,
                hll,
                num_stats,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_stats_count_and_cardinality() {
        let mut stats = SegStatsMap::new();
        for i in 0..50 {
            add_seg_stats_str(&mut stats, "host", format!("h{}", i % 10).as_bytes());
        }
        let host = &stats["host"];
        assert_eq!(host.count, 50);
        assert!(!host.is_numeric);
        assert!(host.num_stats.is_none());
        assert!((9..=11).contains(&host.cardinality()));
    }

    #[test]
    fn test_integer_stats_stay_signed() {
        let mut stats = SegStatsMap::new();
        add_seg_stats_num(&mut stats, "latency", Number::Unsigned(7));
        add_seg_stats_num(&mut stats, "latency", Number::Signed(-3));
        add_seg_stats_num(&mut stats, "latency", Number::Unsigned(20));

        let ns = stats["latency"].num_stats.clone().unwrap();
        assert_eq!(ns.min, StatNum::Int(-3));
        assert_eq!(ns.max, StatNum::Int(20));
        assert_eq!(ns.sum, StatNum::Int(24));
    }

    #[test]
    fn test_float_promotes_all_stats() {
        let mut stats = SegStatsMap::new();
        add_seg_stats_num(&mut stats, "cpu", Number::Unsigned(4));
        add_seg_stats_num(&mut stats, "cpu", Number::Float(0.5));
        add_seg_stats_num(&mut stats, "cpu", Number::Unsigned(10));

        let ns = stats["cpu"].num_stats.clone().unwrap();
        assert_eq!(ns.min, StatNum::Float(0.5));
        assert_eq!(ns.max, StatNum::Float(10.0));
        assert_eq!(ns.sum, StatNum::Float(14.5));
        assert_eq!(stats["cpu"].count, 3);
    }

    #[test]
    fn test_empty_stats_refuse_to_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.sst");
        assert!(matches!(
            flush_seg_stats(&path, &SegStatsMap::new()),
            Err(Error::NoSegStats)
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_flush_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.sst");

        let mut stats = SegStatsMap::new();
        add_seg_stats_str(&mut stats, "level", b"info");
        add_seg_stats_str(&mut stats, "level", b"warn");
        add_seg_stats_num(&mut stats, "bytes", Number::Unsigned(100));
        add_seg_stats_num(&mut stats, "bytes", Number::Unsigned(300));
        flush_seg_stats(&path, &stats).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data[0], 1);
        let back = decode_seg_stats(&data).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back["level"].count, 2);
        assert_eq!(back["level"].cardinality(), 2);
        let ns = back["bytes"].num_stats.clone().unwrap();
        assert_eq!(ns.min, StatNum::Int(100));
        assert_eq!(ns.max, StatNum::Int(300));
        assert_eq!(ns.sum, StatNum::Int(400));
    }
}
