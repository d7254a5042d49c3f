//! Segment Metadata Log
//!
//! Every rotated segment is described by one [`SegMeta`] JSON object on its
//! own line of `segmeta.json`. The log is append-only: replacing or removing
//! an entry rewrites the whole file without the matching lines.
//!
//! ## Side Files
//!
//! - `<segkey>.sid`: the running metadata of a segment that is still being
//!   written, truncated and rewritten after every block flush. After the
//!   active directory is renamed to its final location the file moves with
//!   it, so a rotation that dies before its log append can be completed
//!   from the `.sid` alone (see [`recover_from_sid`]).
//! - `<segkey>.sfm`: the full metadata of a rotated segment, including the
//!   persistent-query ids that matched it.
//!
//! ## Example Log
//!
//! ```text
//! {"segmentKey":"data/n1/final/t/s/3/3","earliestEpochMs":1700000000000,...}
//! {"segmentKey":"data/n1/final/t/s/4/4","earliestEpochMs":1700000900000,...}
//! ```
//!
//! ## Concurrency
//!
//! One [`SegMetaLog`] owns one log file. Readers share a lock; appends and
//! rewrites take it exclusively.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::blob::BlobUploader;
use crate::error::Result;
use crate::fileutils;

/// On-disk sizes of one column's files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColSizeInfo {
    pub cmi_size: u64,
    pub csg_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegMeta {
    pub segment_key: String,
    pub earliest_epoch_ms: u64,
    pub latest_epoch_ms: u64,
    pub segbase_dir: String,
    pub virtual_table_name: String,
    pub record_count: u64,
    #[serde(default)]
    pub bytes_received_count: u64,
    #[serde(default)]
    pub on_disk_bytes: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_names: BTreeMap<String, ColSizeInfo>,
    #[serde(default, rename = "pqids", skip_serializing_if = "BTreeSet::is_empty")]
    pub all_pqids: BTreeSet<String>,
    #[serde(default)]
    pub num_blocks: u16,
    #[serde(default, rename = "orgid", skip_serializing_if = "is_zero")]
    pub org_id: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Contents of a `.sfm` side file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegFullMeta {
    pub seg_meta: SegMeta,
    #[serde(default)]
    pub column_names: BTreeMap<String, ColSizeInfo>,
    #[serde(default)]
    pub pqids: BTreeSet<String>,
    #[serde(default)]
    pub uploaded_seg: bool,
}

impl SegFullMeta {
    pub fn from_seg_meta(meta: &SegMeta) -> Self {
        Self {
            seg_meta: meta.clone(),
            column_names: meta.column_names.clone(),
            pqids: meta.all_pqids.clone(),
            uploaded_seg: false,
        }
    }
}

/// Per virtual-table totals across the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VtableCounts {
    pub bytes_count: u64,
    pub record_count: u64,
    pub on_disk_bytes_count: u64,
}

pub fn sid_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.sid", segkey))
}

pub fn sfm_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.sfm", segkey))
}

/// Truncate and rewrite `<segkey>.sid` with the running metadata.
pub fn write_running_meta(segkey: &str, meta: &SegMeta) -> Result<()> {
    let data = serde_json::to_vec(meta)?;
    fs::write(sid_path(segkey), data)?;
    Ok(())
}

/// Rebuild the final [`SegMeta`] of a segment from the `.sid` that moved
/// with it.
///
/// The running metadata still names the active location, so the key and
/// base directory are replaced with the final ones.
///
/// ## Arguments
///
/// * `final_segkey` - Segment key under the final directory
/// * `final_base_dir` - Directory holding the segment files, with trailing `/`
pub fn recover_from_sid(final_segkey: &str, final_base_dir: &str) -> Result<SegMeta> {
    let data = fs::read(sid_path(final_segkey))?;
    let mut meta: SegMeta = serde_json::from_slice(&data)?;
    meta.segment_key = final_segkey.to_string();
    meta.segbase_dir = final_base_dir.to_string();
    Ok(meta)
}

pub fn write_sfm(sfm: &SegFullMeta) -> Result<()> {
    let path = sfm_path(&sfm.seg_meta.segment_key);
    let mut file = File::create(&path)?;
    file.write_all(&serde_json::to_vec(sfm)?)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_sfm(segkey: &str) -> Result<SegFullMeta> {
    let data = fs::read(sfm_path(segkey))?;
    Ok(serde_json::from_slice(&data)?)
}

#[derive(Debug)]
pub struct SegMetaLog {
    path: PathBuf,
    lock: RwLock<()>,
}

impl SegMetaLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one rotated segment.
    pub fn add_new_rotated_segment(&self, meta: &SegMeta, uploader: &dyn BlobUploader) -> Result<()> {
        self.bulk_add(std::slice::from_ref(meta), uploader)
    }

    /// Write each segment's `.sfm`, then append all entries and fsync once.
    pub fn bulk_add(&self, metas: &[SegMeta], uploader: &dyn BlobUploader) -> Result<()> {
        if metas.is_empty() {
            return Ok(());
        }
        for meta in metas {
            let sfm = SegFullMeta::from_seg_meta(meta);
            if let Err(e) = write_sfm(&sfm) {
                tracing::error!(segkey = %meta.segment_key, error = %e, "Failed to write sfm");
                continue;
            }
            if let Err(e) = uploader.upload_segment_files(&[sfm_path(&meta.segment_key)]) {
                tracing::error!(segkey = %meta.segment_key, error = %e, "Failed to upload sfm");
            }
        }

        let _guard = self.lock.write();
        self.append_unlocked(metas)
    }

    /// All entries in file order. A missing log reads as empty and lines
    /// that fail to parse are skipped.
    pub fn read_segmeta(&self) -> Result<Vec<SegMeta>> {
        let _guard = self.lock.read();
        self.read_unlocked()
    }

    /// Drop every entry with `meta`'s key and append `meta`.
    pub fn replace_segmeta(&self, meta: &SegMeta) -> Result<()> {
        let _guard = self.lock.write();
        let key = meta.segment_key.as_str();
        self.rewrite_unlocked(|m| m.segment_key != key)?;
        self.append_unlocked(std::slice::from_ref(meta))
    }

    /// Remove entries by segment key.
    ///
    /// ## Returns
    ///
    /// Base directories of the removed segments.
    pub fn remove_segments_by_key(&self, keys: &HashSet<String>) -> Result<Vec<String>> {
        let _guard = self.lock.write();
        self.rewrite_unlocked(|m| !keys.contains(&m.segment_key))
    }

    /// Remove every segment of a virtual table.
    pub fn remove_by_index(&self, index_name: &str) -> Result<Vec<String>> {
        let _guard = self.lock.write();
        self.rewrite_unlocked(|m| m.virtual_table_name != index_name)
    }

    /// Record that `pqid` has results in a rotated segment.
    ///
    /// Both the `.sfm` side file and the segment's log line are updated.
    pub fn backfill_pqs_segmeta_entry(&self, segkey: &str, pqid: &str) -> Result<()> {
        let _guard = self.lock.write();
        let mut sfm = read_sfm(segkey)?;
        if sfm.pqids.insert(pqid.to_string()) {
            sfm.seg_meta.all_pqids.insert(pqid.to_string());
            write_sfm(&sfm)?;
        }

        let mut metas = self.read_unlocked()?;
        let mut changed = false;
        for meta in metas.iter_mut().filter(|m| m.segment_key == segkey) {
            changed |= meta.all_pqids.insert(pqid.to_string());
        }
        if changed {
            self.write_all_unlocked(&metas)?;
        }
        Ok(())
    }

    /// Totals per virtual table for one org.
    pub fn vtable_counts(&self, org_id: u64) -> Result<HashMap<String, VtableCounts>> {
        let mut counts: HashMap<String, VtableCounts> = HashMap::new();
        for meta in self.read_segmeta()? {
            if meta.org_id != org_id {
                continue;
            }
            let entry = counts.entry(meta.virtual_table_name).or_default();
            entry.bytes_count += meta.bytes_received_count;
            entry.record_count += meta.record_count;
            entry.on_disk_bytes_count += meta.on_disk_bytes;
        }
        Ok(counts)
    }

    /// Append entries for finalized segments whose rotation never reached
    /// the log, rebuilding each from the `.sid` left in its directory.
    pub fn recover_unregistered(&self, final_root: &Path) -> Result<Vec<SegMeta>> {
        if !final_root.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.write();
        let known: HashSet<String> = self
            .read_unlocked()?
            .into_iter()
            .map(|m| m.segment_key)
            .collect();

        let mut recovered = Vec::new();
        for file in fileutils::list_files_recursive(final_root)? {
            if file.extension().and_then(|e| e.to_str()) != Some("sid") {
                continue;
            }
            let segkey = file.with_extension("").to_string_lossy().into_owned();
            if known.contains(&segkey) {
                continue;
            }
            let base_dir = match file.parent() {
                Some(p) => format!("{}/", p.to_string_lossy()),
                None => continue,
            };
            match recover_from_sid(&segkey, &base_dir) {
                Ok(meta) => {
                    tracing::info!(segkey = %segkey, "Recovered segmeta from running metadata");
                    recovered.push(meta);
                }
                Err(e) => {
                    tracing::error!(segkey = %segkey, error = %e, "Unreadable running metadata");
                }
            }
        }
        self.append_unlocked(&recovered)?;
        Ok(recovered)
    }

    fn append_unlocked(&self, metas: &[SegMeta]) -> Result<()> {
        if metas.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        for meta in metas {
            serde_json::to_writer(&mut buf, meta)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_unlocked(&self) -> Result<Vec<SegMeta>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut metas = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SegMeta>(&line) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    tracing::error!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed segmeta entry"
                    );
                }
            }
        }
        Ok(metas)
    }

    /// Replace the whole log with `metas` through a temp file and rename.
    fn write_all_unlocked(&self, metas: &[SegMeta]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let mut buf = Vec::new();
        for meta in metas {
            serde_json::to_writer(&mut buf, meta)?;
            buf.push(b'\n');
        }
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Rewrite the log keeping entries for which `keep` holds. Returns the
    /// base directories of the dropped entries.
    fn rewrite_unlocked<F>(&self, keep: F) -> Result<Vec<String>>
    where
        F: Fn(&SegMeta) -> bool,
    {
        let (kept, dropped): (Vec<_>, Vec<_>) = self.read_unlocked()?.into_iter().partition(|m| keep(m));
        if dropped.is_empty() {
            return Ok(Vec::new());
        }

        if kept.is_empty() {
            fs::remove_file(&self.path)?;
        } else {
            self.write_all_unlocked(&kept)?;
        }

        tracing::debug!(
            path = %self.path.display(),
            kept = kept.len(),
            removed = dropped.len(),
            "Rewrote segmeta log"
        );
        Ok(dropped.into_iter().map(|m| m.segbase_dir).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::NoopUploader;
    use tempfile::TempDir;

    fn meta(dir: &Path, name: &str, table: &str, records: u64) -> SegMeta {
        let base = dir.join(name);
        fs::create_dir_all(&base).unwrap();
        SegMeta {
            segment_key: format!("{}/{}", base.display(), name),
            segbase_dir: format!("{}/", base.display()),
            virtual_table_name: table.to_string(),
            earliest_epoch_ms: 1000,
            latest_epoch_ms: 2000,
            record_count: records,
            bytes_received_count: records * 10,
            on_disk_bytes: records * 2,
            num_blocks: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_replace_middle_keeps_neighbors() {
        let dir = TempDir::new().unwrap();
        let log = SegMetaLog::new(dir.path().join("segmeta.json"));
        let a = meta(dir.path(), "a", "t1", 1);
        let mut b = meta(dir.path(), "b", "t1", 2);
        let c = meta(dir.path(), "c", "t1", 3);
        for m in [&a, &b, &c] {
            log.add_new_rotated_segment(m, &NoopUploader).unwrap();
        }

        b.record_count = 20;
        log.replace_segmeta(&b).unwrap();

        let entries = log.read_segmeta().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], a);
        assert_eq!(entries[1], c);
        assert_eq!(entries[2].record_count, 20);
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_remove_returns_base_dirs_and_deletes_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = SegMetaLog::new(dir.path().join("segmeta.json"));
        let a = meta(dir.path(), "a", "t1", 1);
        let b = meta(dir.path(), "b", "t2", 1);
        log.bulk_add(&[a.clone(), b.clone()], &NoopUploader).unwrap();

        let removed = log.remove_by_index("t2").unwrap();
        assert_eq!(removed, vec![b.segbase_dir.clone()]);
        assert_eq!(log.read_segmeta().unwrap(), vec![a.clone()]);

        let keys: HashSet<String> = [a.segment_key.clone()].into_iter().collect();
        log.remove_segments_by_key(&keys).unwrap();
        assert!(!log.path().exists());
        assert!(log.read_segmeta().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = SegMetaLog::new(dir.path().join("segmeta.json"));
        let a = meta(dir.path(), "a", "t1", 1);
        log.add_new_rotated_segment(&a, &NoopUploader).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{not json\n\n").unwrap();

        assert_eq!(log.read_segmeta().unwrap(), vec![a]);
    }

    #[test]
    fn test_serialized_field_names() {
        let mut m = SegMeta {
            segment_key: "k".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("segmentKey").is_some());
        assert!(json.get("pqids").is_none());
        assert!(json.get("orgid").is_none());

        m.all_pqids.insert("pq1".into());
        m.org_id = 7;
        m.column_names.insert(
            "host".into(),
            ColSizeInfo {
                cmi_size: 3,
                csg_size: 9,
            },
        );
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["orgid"], 7);
        assert_eq!(json["columnNames"]["host"]["csgSize"], 9);
        assert_eq!(json["pqids"][0], "pq1");
    }

    #[test]
    fn test_sid_recovery_rewrites_location() {
        let dir = TempDir::new().unwrap();
        let active = meta(dir.path(), "active", "t1", 5);
        write_running_meta(&active.segment_key, &active).unwrap();

        let final_dir = dir.path().join("final");
        fs::rename(dir.path().join("active"), &final_dir).unwrap();
        let final_key = format!("{}/active", final_dir.display());
        let final_base = format!("{}/", final_dir.display());

        let recovered = recover_from_sid(&final_key, &final_base).unwrap();
        assert_eq!(recovered.segment_key, final_key);
        assert_eq!(recovered.segbase_dir, final_base);
        assert_eq!(recovered.record_count, 5);
    }

    #[test]
    fn test_backfill_pqid_updates_sfm_and_log() {
        let dir = TempDir::new().unwrap();
        let log = SegMetaLog::new(dir.path().join("segmeta.json"));
        let a = meta(dir.path(), "a", "t1", 1);
        log.add_new_rotated_segment(&a, &NoopUploader).unwrap();
        assert!(read_sfm(&a.segment_key).unwrap().pqids.is_empty());

        log.backfill_pqs_segmeta_entry(&a.segment_key, "pq-9").unwrap();
        let sfm = read_sfm(&a.segment_key).unwrap();
        assert!(sfm.pqids.contains("pq-9"));
        assert!(sfm.seg_meta.all_pqids.contains("pq-9"));

        let logged = &log.read_segmeta().unwrap()[0];
        assert!(logged.all_pqids.contains("pq-9"));
        assert_eq!(logged.record_count, a.record_count);

        // a second backfill of the same pqid leaves one line
        log.backfill_pqs_segmeta_entry(&a.segment_key, "pq-9").unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_vtable_counts_filter_by_org() {
        let dir = TempDir::new().unwrap();
        let log = SegMetaLog::new(dir.path().join("segmeta.json"));
        let a = meta(dir.path(), "a", "logs", 4);
        let b = meta(dir.path(), "b", "logs", 6);
        let mut c = meta(dir.path(), "c", "logs", 100);
        c.org_id = 2;
        log.bulk_add(&[a, b, c], &NoopUploader).unwrap();

        let counts = log.vtable_counts(0).unwrap();
        assert_eq!(
            counts["logs"],
            VtableCounts {
                bytes_count: 100,
                record_count: 10,
                on_disk_bytes_count: 20,
            }
        );
        assert_eq!(log.vtable_counts(2).unwrap()["logs"].record_count, 100);
    }
}
