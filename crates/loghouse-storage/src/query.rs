//! Persistent Query Hooks
//!
//! The write path does not run searches itself. It receives the set of
//! persistent queries (pqids) and persistent aggregations for a table through
//! [`PersistentQueryProvider`], tracks which columns those queries touch, and
//! asks a [`StreamingSearch`] whether each freshly encoded record matches.
//! Matches become per-block record bitmaps (`pqmr`).
//!
//! ## Flow
//!
//! ```text
//! reset of WIP block ──► provider.top_persistent_searches(table, org)
//!                              │
//!                              ▼
//!                        PqColumnTracker  (columns of all pqids, or wildcard)
//!                              │
//! encode record ──► touched a tracked column? ──► StreamingSearch::matches
//!                                                    │
//!                                                    ▼
//!                                         pq_matches[pqid].add(rec_num)
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use loghouse_core::ValueTag;

use crate::colwip::ColWip;
use crate::error::Result;

/// What the write path needs to know about one persistent query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PqQuery {
    /// Columns the query filters on
    pub columns: BTreeSet<String>,
    /// The query searches every column
    pub wildcard: bool,
}

impl PqQuery {
    pub fn on_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            wildcard: false,
        }
    }

    pub fn wildcard() -> Self {
        Self {
            columns: BTreeSet::new(),
            wildcard: true,
        }
    }
}

/// Group-by and measure columns of the persistent aggregations on a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentAggs {
    pub group_by: Vec<String>,
    pub measures: BTreeSet<String>,
}

/// Source of persistent queries and aggregations.
pub trait PersistentQueryProvider: Send + Sync {
    /// Persistent searches on `table`, keyed by pqid.
    fn top_persistent_searches(&self, table: &str, org_id: u64) -> Result<HashMap<String, PqQuery>>;

    /// Persistent aggregations on `table`, used to pick star-tree columns.
    fn top_persistent_aggs(&self, table: &str) -> PersistentAggs;
}

/// Provider with no persistent queries or aggregations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueryProvider;

impl PersistentQueryProvider for NoopQueryProvider {
    fn top_persistent_searches(&self, _table: &str, _org_id: u64) -> Result<HashMap<String, PqQuery>> {
        Ok(HashMap::new())
    }

    fn top_persistent_aggs(&self, _table: &str) -> PersistentAggs {
        PersistentAggs::default()
    }
}

/// Provider returning the same queries and aggregations for every table.
#[derive(Debug, Clone, Default)]
pub struct StaticQueryProvider {
    pub searches: HashMap<String, PqQuery>,
    pub aggs: PersistentAggs,
}

impl PersistentQueryProvider for StaticQueryProvider {
    fn top_persistent_searches(&self, _table: &str, _org_id: u64) -> Result<HashMap<String, PqQuery>> {
        Ok(self.searches.clone())
    }

    fn top_persistent_aggs(&self, _table: &str) -> PersistentAggs {
        self.aggs.clone()
    }
}

/// Columns touched by the tracked persistent queries of one store.
#[derive(Debug, Clone, Default)]
pub struct PqColumnTracker {
    has_wildcard: bool,
    columns: HashSet<String>,
    queries: HashMap<String, PqQuery>,
}

impl PqColumnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_query(&mut self, pqid: &str, query: PqQuery) {
        if !self.has_wildcard {
            self.columns.extend(query.columns.iter().cloned());
            self.has_wildcard = query.wildcard;
        }
        self.queries.insert(pqid.to_string(), query);
    }

    pub fn is_column_in_pquery(&self, cname: &str) -> bool {
        self.has_wildcard || self.columns.contains(cname)
    }

    pub fn queries(&self) -> &HashMap<String, PqQuery> {
        &self.queries
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Read-only view of the record just written to a WIP block.
pub struct WipRecordView<'a> {
    col_wips: &'a HashMap<String, ColWip>,
    rec_num: u16,
}

impl<'a> WipRecordView<'a> {
    pub(crate) fn new(col_wips: &'a HashMap<String, ColWip>, rec_num: u16) -> Self {
        Self { col_wips, rec_num }
    }

    pub fn rec_num(&self) -> u16 {
        self.rec_num
    }

    /// Encoded value of `cname` in this record, `None` if the column is
    /// absent from the block or holds a backfill.
    pub fn column(&self, cname: &str) -> Option<&'a [u8]> {
        let value = self.col_wips.get(cname)?.last_record();
        match value.first() {
            Some(&tag) if tag != ValueTag::Backfill.as_byte() => Some(value),
            _ => None,
        }
    }

    /// Names of the columns holding a value in this record.
    pub fn present_columns(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.col_wips
            .iter()
            .filter(|(_, cw)| matches!(cw.last_record().first(), Some(&t) if t != ValueTag::Backfill.as_byte()))
            .map(|(name, _)| name.as_str())
    }
}

/// Evaluates a persistent query against one freshly encoded record.
pub trait StreamingSearch: Send + Sync {
    fn matches(&self, pqid: &str, query: &PqQuery, record: &WipRecordView<'_>) -> bool;
}

/// Matches a record when any column the query filters on holds a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnPresenceSearch;

impl StreamingSearch for ColumnPresenceSearch {
    fn matches(&self, _pqid: &str, query: &PqQuery, record: &WipRecordView<'_>) -> bool {
        if query.wildcard {
            return record.present_columns().next().is_some();
        }
        query.columns.iter().any(|c| record.column(c).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghouse_core::{encode_backfill, encode_str};

    fn wip_with(values: &[(&str, Option<&str>)]) -> HashMap<String, ColWip> {
        let mut col_wips = HashMap::new();
        for (name, value) in values {
            let mut cw = ColWip::new(Vec::new(), 501);
            cw.start_record();
            match value {
                Some(v) => {
                    encode_str(&mut cw.buf, v.as_bytes()).unwrap();
                }
                None => {
                    encode_backfill(&mut cw.buf);
                }
            }
            col_wips.insert(name.to_string(), cw);
        }
        col_wips
    }

    #[test]
    fn test_tracker_columns_and_wildcard() {
        let mut tracker = PqColumnTracker::new();
        tracker.add_query("pq1", PqQuery::on_columns(["status"]));
        assert!(tracker.is_column_in_pquery("status"));
        assert!(!tracker.is_column_in_pquery("host"));

        tracker.add_query("pq2", PqQuery::wildcard());
        assert!(tracker.is_column_in_pquery("host"));
        assert_eq!(tracker.queries().len(), 2);
    }

    #[test]
    fn test_presence_search_ignores_backfill() {
        let col_wips = wip_with(&[("status", None), ("host", Some("web-1"))]);
        let view = WipRecordView::new(&col_wips, 0);
        let search = ColumnPresenceSearch;

        assert!(!search.matches("pq1", &PqQuery::on_columns(["status"]), &view));
        assert!(search.matches("pq2", &PqQuery::on_columns(["status", "host"]), &view));
        assert!(search.matches("pq3", &PqQuery::wildcard(), &view));
        assert!(view.column("missing").is_none());
    }
}
