//! Segment Store Registry - One Store per Stream
//!
//! `SegStoreRegistry` keeps one [`SegStore`] per stream alive across ingest
//! calls and drives the background work: idle flushes, time-based rotation
//! and pruning of the recently-rotated map.
//!
//! ## Example Usage
//!
//! ```ignore
//! let env = WriterEnv::new(config)?;
//! let registry = Arc::new(SegStoreRegistry::new(env));
//!
//! let handles = [
//!     Arc::clone(&registry).start_background_flush(Duration::from_secs(1)),
//!     Arc::clone(&registry).start_time_rotation(),
//!     Arc::clone(&registry).start_recently_rotated_pruner(),
//! ];
//!
//! registry.add_entry("stream-1", "logs", 0, &raw, ts_ms, raw.len() as u64, false, SignalType::Events)?;
//!
//! // on shutdown
//! for h in handles { h.abort(); }
//! registry.shutdown();
//! ```
//!
//! ## Thread Safety
//!
//! - The store map sits behind one `RwLock`; lookups share it and only store
//!   creation and removal take it exclusively
//! - Each store is wrapped in `Arc<Mutex<SegStore>>`, so ingest, flush and
//!   rotation of one stream are serialized while other streams proceed
//! - Background passes snapshot the map under the read lock, release it, and
//!   then lock stores one at a time
//!
//! ## Backpressure
//!
//! Opening a store past `max_allowed_seg_stores` fails with the retryable
//! [`Error::TooManySegStores`].

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::time::{self, Instant};

use crate::env::WriterEnv;
use crate::error::{Error, Result};
use crate::segmeta::VtableCounts;
use crate::segstore::{now_ms, SegStore, StoreOptions};
use crate::unrotated::RECENTLY_ROTATED_TTL;
use crate::wip::SignalType;

/// Shortest wait before the first time-based rotation.
const ROTATION_WARMUP: Duration = Duration::from_secs(60);

/// How often the recently-rotated map is pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

type StoreMap = RwLock<HashMap<String, Arc<Mutex<SegStore>>>>;

pub struct SegStoreRegistry {
    env: Arc<WriterEnv>,
    stores: StoreMap,
}

impl SegStoreRegistry {
    pub fn new(env: Arc<WriterEnv>) -> Self {
        Self {
            env,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn env(&self) -> &Arc<WriterEnv> {
        &self.env
    }

    /// Get the store of `stream_id`, opening one if needed.
    ///
    /// ## Errors
    ///
    /// [`Error::TooManySegStores`] when the registry is full.
    pub fn get_seg_store(
        &self,
        stream_id: &str,
        table: &str,
        org_id: u64,
        options: StoreOptions,
    ) -> Result<Arc<Mutex<SegStore>>> {
        {
            let stores = self.stores.read();
            if let Some(store) = stores.get(stream_id) {
                return Ok(Arc::clone(store));
            }
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(stream_id) {
            return Ok(Arc::clone(store));
        }

        let limit = self.env.config.max_allowed_seg_stores;
        if stores.len() >= limit {
            tracing::error!(stream = %stream_id, open = stores.len(), limit, "Too many segment stores");
            return Err(Error::TooManySegStores(stores.len()));
        }

        tracing::debug!(stream = %stream_id, table = %table, "Creating segment store");
        let store = SegStore::new(Arc::clone(&self.env), stream_id, table, org_id, options)?;
        let store = Arc::new(Mutex::new(store));
        stores.insert(stream_id.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Ingest one record into the store of `stream_id`.
    ///
    /// ## Returns
    ///
    /// Whether the record matched a tracked persistent query.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &self,
        stream_id: &str,
        table: &str,
        org_id: u64,
        raw: &[u8],
        ts_ms: u64,
        bytes_received: u64,
        flush: bool,
        signal: SignalType,
    ) -> Result<bool> {
        let store = self.get_seg_store(stream_id, table, org_id, StoreOptions::default())?;
        let mut guard = store.lock();
        guard.add_entry(raw, ts_ms, bytes_received, flush, signal)
    }

    fn snapshot(&self) -> Vec<(String, Arc<Mutex<SegStore>>)> {
        self.stores
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Flush every store whose WIP block sat idle for `idle_for`, or whose
    /// oldest pending record waited longer than `max_wait`.
    ///
    /// ## Returns
    ///
    /// Number of stores flushed.
    pub fn flush_idle(&self, idle_for: Duration, max_wait: Duration) -> usize {
        let now = now_ms();
        let idle_ms = idle_for.as_millis() as u64;
        let wait_ms = max_wait.as_millis() as u64;

        let mut flush_count = 0;
        let mut error_count = 0;
        for (stream_id, store) in self.snapshot() {
            let mut guard = store.lock();
            if !guard.has_pending() {
                continue;
            }
            let idle = now.saturating_sub(guard.last_updated_ms()) >= idle_ms;
            let waited = guard
                .first_pending_ms()
                .is_some_and(|t| now.saturating_sub(t) >= wait_ms);
            if !(idle || waited) {
                continue;
            }
            match guard.append_wip_to_segfile(false, false) {
                Ok(()) => flush_count += 1,
                Err(e) => {
                    error_count += 1;
                    tracing::error!(stream = %stream_id, error = %e, "Idle flush failed");
                }
            }
        }

        if flush_count > 0 || error_count > 0 {
            tracing::debug!(flushed = flush_count, errors = error_count, "Idle flush completed");
        }
        flush_count
    }

    /// Rotate every store on time and drop stores that have been empty and
    /// idle for `stale_after`.
    ///
    /// ## Returns
    ///
    /// Number of stores removed.
    pub fn rotate_on_time(&self, stale_after: Duration) -> usize {
        let now = now_ms();
        let stale_ms = stale_after.as_millis() as u64;
        let mut stale = Vec::new();

        for (stream_id, store) in self.snapshot() {
            let mut guard = store.lock();
            if let Err(e) = guard.append_wip_to_segfile(false, true) {
                tracing::error!(stream = %stream_id, error = %e, "Time-based rotation failed");
                continue;
            }
            if guard.record_count() == 0 && now.saturating_sub(guard.last_updated_ms()) >= stale_ms {
                stale.push(stream_id);
            }
        }

        if stale.is_empty() {
            return 0;
        }
        let mut stores = self.stores.write();
        let mut removed = 0;
        for stream_id in stale {
            let Some(store) = stores.remove(&stream_id) else {
                continue;
            };
            let guard = store.lock();
            if let Err(e) = guard.remove_empty_segment_dir() {
                tracing::warn!(stream = %stream_id, error = %e, "Failed to remove empty segment directory");
            }
            tracing::debug!(stream = %stream_id, "Removed stale segment store");
            removed += 1;
        }
        removed
    }

    /// Flush and rotate every store, then drop them all.
    ///
    /// Called on shutdown; every store is drained under its own lock before
    /// this returns.
    pub fn forced_flush(&self) -> usize {
        let stores: Vec<(String, Arc<Mutex<SegStore>>)> = self.stores.write().drain().collect();

        let mut flush_count = 0;
        for (stream_id, store) in &stores {
            let mut guard = store.lock();
            match guard.append_wip_to_segfile(true, false) {
                Ok(()) => flush_count += 1,
                Err(e) => {
                    tracing::error!(stream = %stream_id, error = %e, "Forced flush failed")
                }
            }
        }
        flush_count
    }

    /// Drop every store of `table` and delete its active and rotated
    /// segments.
    pub fn delete_virtual_table(&self, table: &str, org_id: u64) -> Result<()> {
        let removed: Vec<Arc<Mutex<SegStore>>> = {
            let mut stores = self.stores.write();
            let keys: Vec<String> = stores
                .iter()
                .filter(|(_, s)| {
                    let s = s.lock();
                    s.table() == table && s.org_id() == org_id
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| stores.remove(k)).collect()
        };

        for store in removed {
            let guard = store.lock();
            self.env.unrotated.remove(guard.segment_key());
            if let Err(e) = remove_dir_all_if_exists(guard.segbase_dir()) {
                tracing::error!(dir = %guard.segbase_dir(), error = %e, "Failed to delete active segment");
            }
        }

        for dir in self.env.segmeta.remove_by_index(table)? {
            if let Err(e) = remove_dir_all_if_exists(&dir) {
                tracing::error!(dir = %dir, error = %e, "Failed to delete rotated segment");
            }
        }
        tracing::info!(table = %table, org_id, "Deleted virtual table");
        Ok(())
    }

    /// Totals of the data held by open stores, per virtual table.
    pub fn unrotated_vtable_counts(&self, org_id: u64) -> HashMap<String, VtableCounts> {
        let mut counts: HashMap<String, VtableCounts> = HashMap::new();
        for (_, store) in self.snapshot() {
            let guard = store.lock();
            if guard.org_id() != org_id {
                continue;
            }
            let entry = counts.entry(guard.table().to_string()).or_default();
            entry.bytes_count += guard.bytes_received();
            entry.record_count += guard.record_count();
            entry.on_disk_bytes_count += guard.on_disk_bytes();
        }
        counts
    }

    /// Number of open stores.
    pub fn store_count(&self) -> usize {
        self.stores.read().len()
    }

    /// Start the idle-flush loop.
    ///
    /// Every `interval`, stores idle for `seg_flush_interval_secs` or holding
    /// a record older than `max_wait_wip_flush_secs` are flushed.
    pub fn start_background_flush(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            let idle_for = self.env.config.seg_flush_interval();
            let max_wait = Duration::from_secs(self.env.config.max_wait_wip_flush_secs);
            loop {
                ticker.tick().await;
                tracing::trace!("Idle flush tick");

                let registry = Arc::clone(&self);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || registry.flush_idle(idle_for, max_wait)).await
                {
                    tracing::error!(error = %e, "Idle flush task failed");
                }
            }
        })
    }

    /// Start the time-based rotation loop.
    ///
    /// The first rotation runs at a random point in
    /// `[60s, 60s + segment_rotate_duration)` so nodes started together do
    /// not rotate together; later ones every `segment_rotate_duration`.
    pub fn start_time_rotation(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.env.config.segment_rotate_duration();
        let jitter_ms = rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64);
        let first = ROTATION_WARMUP + Duration::from_millis(jitter_ms);

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + first, period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                tracing::trace!("Time rotation tick");

                let registry = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || registry.rotate_on_time(2 * period)).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Removed stale segment stores")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Time rotation task failed"),
                }
            }
        })
    }

    /// Start the loop that forgets rotated segments after
    /// [`RECENTLY_ROTATED_TTL`].
    pub fn start_recently_rotated_pruner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                tracing::trace!("Recently rotated prune tick");
                self.env.unrotated.prune_recently_rotated(RECENTLY_ROTATED_TTL);
            }
        })
    }

    /// Flush and rotate everything that is still open.
    pub fn shutdown(&self) {
        tracing::info!(stores = self.store_count(), "Shutting down segment stores, forcing flush");
        let flushed = self.forced_flush();
        tracing::info!(flushed, "Segment store shutdown complete");
    }
}

fn remove_dir_all_if_exists(dir: &str) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, max_stores: usize) -> SegStoreRegistry {
        let root = dir.path().display();
        let config = WriterConfig {
            data_path: format!("{}/", root),
            smr_base_dir: format!("{}/ingest/", root),
            max_allowed_seg_stores: max_stores,
            ..Default::default()
        };
        SegStoreRegistry::new(WriterEnv::new(config).unwrap())
    }

    fn add(reg: &SegStoreRegistry, stream: &str, table: &str, i: u64) {
        let raw = format!(r#"{{"level":"info","n":{}}}"#, i);
        reg.add_entry(
            stream,
            table,
            0,
            raw.as_bytes(),
            1_700_000_000_000 + i,
            raw.len() as u64,
            false,
            SignalType::Events,
        )
        .unwrap();
    }

    #[test]
    fn test_store_limit_is_retryable() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, 2);
        add(&reg, "s1", "logs", 0);
        add(&reg, "s2", "logs", 0);
        add(&reg, "s1", "logs", 1);
        assert_eq!(reg.store_count(), 2);

        let err = reg
            .get_seg_store("s3", "logs", 0, StoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::TooManySegStores(2)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_flush_idle_flushes_pending_blocks() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, 10);
        add(&reg, "s1", "logs", 0);

        assert_eq!(reg.flush_idle(Duration::from_secs(3600), Duration::from_secs(3600)), 0);
        assert_eq!(reg.flush_idle(Duration::ZERO, Duration::from_secs(3600)), 1);

        let store = reg.get_seg_store("s1", "logs", 0, StoreOptions::default()).unwrap();
        assert_eq!(store.lock().num_blocks(), 1);
        assert!(!store.lock().has_pending());
        assert_eq!(reg.flush_idle(Duration::ZERO, Duration::ZERO), 0);
    }

    #[test]
    fn test_rotate_on_time_and_stale_removal() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, 10);
        add(&reg, "s1", "logs", 0);
        add(&reg, "s1", "logs", 1);

        assert_eq!(reg.rotate_on_time(Duration::from_secs(3600)), 0);
        assert_eq!(reg.env().segmeta.read_segmeta().unwrap().len(), 1);

        let store = reg.get_seg_store("s1", "logs", 0, StoreOptions::default()).unwrap();
        let empty_dir = store.lock().segment_dir();
        assert!(empty_dir.exists());
        drop(store);

        assert_eq!(reg.rotate_on_time(Duration::ZERO), 1);
        assert_eq!(reg.store_count(), 0);
        assert!(!empty_dir.exists());
        assert_eq!(reg.env().segmeta.read_segmeta().unwrap().len(), 1);
    }

    #[test]
    fn test_forced_flush_drains_everything() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, 10);
        for i in 0..3 {
            add(&reg, "s1", "logs", i);
            add(&reg, "s2", "traces", i);
        }

        let counts = reg.unrotated_vtable_counts(0);
        assert_eq!(counts["logs"].record_count, 3);
        assert_eq!(counts["traces"].record_count, 3);

        reg.shutdown();
        assert_eq!(reg.store_count(), 0);
        let metas = reg.env().segmeta.read_segmeta().unwrap();
        assert_eq!(metas.len(), 2);
        assert!(metas.iter().all(|m| m.record_count == 3));
    }

    #[test]
    fn test_delete_virtual_table() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, 10);
        add(&reg, "s1", "logs", 0);
        reg.forced_flush();
        add(&reg, "s1", "logs", 1);
        add(&reg, "s2", "other", 0);

        let final_dir = reg.env().segmeta.read_segmeta().unwrap()[0].segbase_dir.clone();
        assert!(std::path::Path::new(&final_dir).exists());

        reg.delete_virtual_table("logs", 0).unwrap();
        assert_eq!(reg.store_count(), 1);
        assert!(reg.env().segmeta.read_segmeta().unwrap().is_empty());
        assert!(!std::path::Path::new(&final_dir).exists());
    }

    #[tokio::test]
    async fn test_background_flush_loop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();
        let config = WriterConfig {
            data_path: format!("{}/", root),
            smr_base_dir: format!("{}/ingest/", root),
            seg_flush_interval_secs: 0,
            ..Default::default()
        };
        let reg = Arc::new(SegStoreRegistry::new(WriterEnv::new(config).unwrap()));
        add(&reg, "s1", "logs", 0);

        let handle = Arc::clone(&reg).start_background_flush(Duration::from_millis(10));
        let store = reg.get_seg_store("s1", "logs", 0, StoreOptions::default()).unwrap();
        for _ in 0..200 {
            if store.lock().num_blocks() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(store.lock().num_blocks(), 1);
    }
}
