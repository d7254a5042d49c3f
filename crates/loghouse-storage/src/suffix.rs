//! Segment suffixes.
//!
//! Every segment of a stream gets a number that is never reused, even across
//! restarts. The number names the segment directory and the segment key:
//! `<data_path><host>/active/<table>/<stream>/<suffix>/<suffix>`.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub trait SuffixGenerator: Send + Sync {
    /// Return the next unused suffix of `(stream_id, table)`.
    fn next_suffix(&self, stream_id: &str, table: &str) -> Result<u64>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SuffixEntry {
    next_suffix: u64,
}

/// Keeps the next suffix of each stream in
/// `<base_dir>/<table>/<stream_id>.suffix`.
#[derive(Debug)]
pub struct FileSuffixGenerator {
    base_dir: PathBuf,
    cache: Mutex<HashMap<(String, String), u64>>,
}

impl FileSuffixGenerator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn entry_path(&self, stream_id: &str, table: &str) -> PathBuf {
        self.base_dir.join(table).join(format!("{}.suffix", stream_id))
    }

    fn load(&self, path: &PathBuf) -> Result<u64> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice::<SuffixEntry>(&data)?.next_suffix),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl SuffixGenerator for FileSuffixGenerator {
    fn next_suffix(&self, stream_id: &str, table: &str) -> Result<u64> {
        let path = self.entry_path(stream_id, table);
        let mut cache = self.cache.lock();
        let key = (stream_id.to_string(), table.to_string());
        let current = match cache.get(&key) {
            Some(n) => *n,
            None => self.load(&path)?,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let entry = SuffixEntry {
            next_suffix: current + 1,
        };
        fs::write(&path, serde_json::to_vec(&entry)?)?;
        cache.insert(key, current + 1);
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_suffixes_increase_per_stream() {
        let dir = TempDir::new().unwrap();
        let gen = FileSuffixGenerator::new(dir.path());
        assert_eq!(gen.next_suffix("s1", "logs").unwrap(), 0);
        assert_eq!(gen.next_suffix("s1", "logs").unwrap(), 1);
        assert_eq!(gen.next_suffix("s2", "logs").unwrap(), 0);
        assert_eq!(gen.next_suffix("s1", "traces").unwrap(), 0);
    }

    #[test]
    fn test_suffixes_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let gen = FileSuffixGenerator::new(dir.path());
            gen.next_suffix("s1", "logs").unwrap();
            gen.next_suffix("s1", "logs").unwrap();
        }
        let gen = FileSuffixGenerator::new(dir.path());
        assert_eq!(gen.next_suffix("s1", "logs").unwrap(), 2);
    }
}
