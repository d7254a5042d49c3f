//! Blob storage hand-off.
//!
//! Rotated segment files and segmeta side files are pushed to remote storage
//! through a [`BlobUploader`]. Upload failures are logged by the caller and
//! never undo a rotation; the local files stay authoritative.

use std::path::PathBuf;

use crate::error::Result;

pub trait BlobUploader: Send + Sync {
    /// Upload finalized segment files.
    fn upload_segment_files(&self, files: &[PathBuf]) -> Result<()>;

    /// Upload the ingest node directory holding the segmeta log.
    fn upload_ingest_node_dir(&self) -> Result<()> {
        Ok(())
    }
}

/// Uploader for deployments without remote storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUploader;

impl BlobUploader for NoopUploader {
    fn upload_segment_files(&self, files: &[PathBuf]) -> Result<()> {
        tracing::debug!(files = files.len(), "Blob upload disabled, keeping files local");
        Ok(())
    }
}
