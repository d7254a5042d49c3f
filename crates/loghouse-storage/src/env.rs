//! Shared services of the write path.
//!
//! A [`WriterEnv`] bundles everything segment stores share across streams:
//! the configuration, buffer and star-tree pools, the descriptor limiter,
//! the segmeta log and unrotated registry, and the collaborators the write
//! path calls out to (persistent-query source, streaming search, blob
//! uploader, suffix generator). It is built once at startup and handed to the
//! [`SegStoreRegistry`](crate::registry::SegStoreRegistry).
//!
//! ## Usage
//!
//! ```ignore
//! let env = WriterEnv::builder(config)
//!     .query_provider(Arc::new(my_provider))
//!     .uploader(Arc::new(my_uploader))
//!     .build()?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use loghouse_core::BufferPool;

use crate::blob::{BlobUploader, NoopUploader};
use crate::config::WriterConfig;
use crate::error::Result;
use crate::fdlimit::FdLimiter;
use crate::query::{ColumnPresenceSearch, NoopQueryProvider, PersistentQueryProvider, StreamingSearch};
use crate::segmeta::SegMetaLog;
use crate::startree::StarTreePool;
use crate::suffix::{FileSuffixGenerator, SuffixGenerator};
use crate::unrotated::UnrotatedRegistry;

/// Initial capacity of pooled column buffers.
const COLUMN_BUFFER_CAPACITY: usize = 64 * 1024;
/// Column buffers kept in the pool when idle.
const MAX_POOLED_BUFFERS: usize = 1024;

pub struct WriterEnv {
    pub config: WriterConfig,
    pub buffer_pool: Arc<BufferPool>,
    pub fd_limiter: Arc<FdLimiter>,
    pub star_trees: Arc<StarTreePool>,
    pub segmeta: SegMetaLog,
    pub unrotated: UnrotatedRegistry,
    pub query_provider: Arc<dyn PersistentQueryProvider>,
    pub streaming_search: Arc<dyn StreamingSearch>,
    pub uploader: Arc<dyn BlobUploader>,
    pub suffixes: Arc<dyn SuffixGenerator>,
}

impl std::fmt::Debug for WriterEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterEnv")
            .field("config", &self.config)
            .field("segmeta", &self.segmeta.path())
            .finish_non_exhaustive()
    }
}

impl WriterEnv {
    pub fn builder(config: WriterConfig) -> WriterEnvBuilder {
        WriterEnvBuilder {
            config,
            query_provider: None,
            streaming_search: None,
            uploader: None,
            suffixes: None,
        }
    }

    /// Environment with no persistent queries and no remote storage.
    pub fn new(config: WriterConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }
}

pub struct WriterEnvBuilder {
    config: WriterConfig,
    query_provider: Option<Arc<dyn PersistentQueryProvider>>,
    streaming_search: Option<Arc<dyn StreamingSearch>>,
    uploader: Option<Arc<dyn BlobUploader>>,
    suffixes: Option<Arc<dyn SuffixGenerator>>,
}

impl WriterEnvBuilder {
    pub fn query_provider(mut self, provider: Arc<dyn PersistentQueryProvider>) -> Self {
        self.query_provider = Some(provider);
        self
    }

    pub fn streaming_search(mut self, search: Arc<dyn StreamingSearch>) -> Self {
        self.streaming_search = Some(search);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn BlobUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn suffixes(mut self, suffixes: Arc<dyn SuffixGenerator>) -> Self {
        self.suffixes = Some(suffixes);
        self
    }

    pub fn build(self) -> Result<Arc<WriterEnv>> {
        let config = self.config;
        config.validate()?;

        let suffixes = match self.suffixes {
            Some(s) => s,
            None => {
                let dir = PathBuf::from(format!("{}{}/suffix/", config.data_path, config.host_id));
                Arc::new(FileSuffixGenerator::new(dir))
            }
        };

        Ok(Arc::new(WriterEnv {
            buffer_pool: Arc::new(BufferPool::new(COLUMN_BUFFER_CAPACITY, MAX_POOLED_BUFFERS)),
            fd_limiter: FdLimiter::new(config.max_open_fds),
            star_trees: StarTreePool::new(config.max_concurrent_agile_trees),
            segmeta: SegMetaLog::new(config.segmeta_path()),
            unrotated: UnrotatedRegistry::new(),
            query_provider: self
                .query_provider
                .unwrap_or_else(|| Arc::new(NoopQueryProvider)),
            streaming_search: self
                .streaming_search
                .unwrap_or_else(|| Arc::new(ColumnPresenceSearch)),
            uploader: self.uploader.unwrap_or_else(|| Arc::new(NoopUploader)),
            suffixes,
            config,
        }))
    }
}
