//! File helpers shared by the flush and rotation paths.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Append `data` to `path`, creating it if needed.
///
/// ## Returns
///
/// The offset at which `data` starts.
pub fn append_block(path: &Path, data: &[u8]) -> Result<u64> {
    let mut fd = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = fd.metadata()?.len();
    fd.write_all(data)?;
    Ok(offset)
}

/// Size of a file, `None` when it does not exist.
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

/// Every regular file under `dir`, recursively, sorted.
pub fn list_files_recursive(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Total size of the files under `dir`.
pub fn dir_size(dir: &Path) -> Result<u64> {
    Ok(list_files_recursive(dir)?
        .iter()
        .filter_map(|p| file_size(p))
        .sum())
}

/// Remove `dir` if it exists and holds no entries.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(dir)?;
                return Ok(true);
            }
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
