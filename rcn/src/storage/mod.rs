use crate::config::Config;
use bytes::Bytes;
use common::{FileEntry, FileManifest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

pub mod alist;
pub mod local;
pub mod minio;
pub mod webdav;

/// Path prefix excluded from GC and manifest-diff accounting. Bandwidth
/// measurement files live here and are never declared by the manifest.
pub const MEASURE_PREFIX: &str = "measure/";

/// Bound on the recursive namespace scan that warms a cold index.
pub const SCAN_CONCURRENCY: usize = 10;

/// Positive existence results are cached this long. Negative results are
/// never cached: a file can appear between checks.
pub const EXISTS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// What `express` produced. The HTTP layer turns this into a response; the
/// backends stay independent of the router types.
#[derive(Debug)]
pub enum ServeBody {
    /// Zero-length object recorded as an empty marker: end immediately.
    Empty,
    /// Stream `length` bytes of a local file starting at `offset`.
    File {
        file: tokio::fs::File,
        offset: u64,
        length: u64,
        total: u64,
    },
    /// Redirect the client to the backend's own download link.
    Redirect { location: String },
    /// Replay an upstream response verbatim (alist pass-through).
    Upstream {
        status: u16,
        location: Option<String>,
        body: Bytes,
    },
}

#[derive(Debug)]
pub struct ServeReply {
    pub body: ServeBody,
    pub bytes: u64,
    pub hits: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcSummary {
    pub count: u64,
    pub bytes_freed: u64,
}

/// Capability interface over a content store. Variants are added as new
/// implementations of this trait, never as call-site branches.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the base namespace if it does not exist yet.
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Write-then-delete probe. Any I/O failure is a `false`, consumed by
    /// the controller to decide startup/sync readiness; never an error.
    async fn check(&self) -> bool;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Persist `content` and index it under `meta.hash`. Zero-length
    /// content is recorded as an empty marker without a physical write.
    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        meta: &FileEntry,
    ) -> Result<(), StorageError>;

    /// Entries of `manifest` whose hash is absent from the index. A cold
    /// index is populated by one bounded-concurrency scan as a side
    /// effect; a warm index makes this a pure set difference.
    async fn get_missing_files(
        &self,
        manifest: &FileManifest,
    ) -> Result<Vec<FileEntry>, StorageError>;

    /// Delete objects whose identity is absent from `manifest`, skipping
    /// the exempt measure namespace.
    async fn gc(&self, manifest: &FileManifest) -> Result<GcSummary, StorageError>;

    /// Serve one object, honoring an optional Range header where the
    /// backend streams bytes itself.
    async fn express(
        &self,
        hash_path: &str,
        range: Option<&str>,
    ) -> Result<ServeReply, StorageError>;

    /// Directly fetchable URL for internal probes. Backends without
    /// redirect semantics signal `Unsupported`.
    fn get_absolute_path(&self, path: &str) -> Result<String, StorageError>;
}

/// Construct the backend selected by the configuration.
pub fn make_storage(config: &Config) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.storage.as_str() {
        "local" => Arc::new(local::LocalStorage::new(config.storage_root.clone())),
        "webdav" => Arc::new(webdav::WebdavStorage::new(config)?),
        "alist" => Arc::new(alist::AlistWebdavStorage::new(config)?),
        "minio" => Arc::new(minio::MinioStorage::new(config)?),
        other => {
            return Err(StorageError::Backend(format!(
                "unknown storage backend `{other}`"
            )));
        }
    };
    Ok(backend)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub size: u64,
    pub path: String,
}

/// In-memory mapping hash → {size, path}, shared by every backend.
/// Authoritative only after a successful full scan or incremental writes.
#[derive(Default)]
pub struct StorageIndex {
    files: RwLock<HashMap<String, IndexEntry>>,
    empty_files: RwLock<HashSet<String>>,
}

impl StorageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, hash: &str, entry: IndexEntry) {
        self.files.write().await.insert(hash.to_string(), entry);
    }

    pub async fn remove(&self, hash: &str) {
        self.files.write().await.remove(hash);
    }

    pub async fn is_warm(&self) -> bool {
        !self.files.read().await.is_empty()
    }

    pub async fn mark_empty(&self, path: &str) {
        self.empty_files.write().await.insert(path.to_string());
    }

    pub async fn is_empty_marker(&self, path: &str) -> bool {
        self.empty_files.read().await.contains(path)
    }

    pub async fn size_of(&self, hash: &str) -> Option<u64> {
        self.files.read().await.get(hash).map(|e| e.size)
    }

    /// Manifest entries not present in the index. Pure set difference.
    pub async fn missing_from(&self, manifest: &FileManifest) -> Vec<FileEntry> {
        let files = self.files.read().await;
        manifest
            .entries
            .iter()
            .filter(|e| !files.contains_key(&e.hash))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, size: u64) -> FileEntry {
        FileEntry {
            path: format!("/files/{hash}"),
            hash: hash.to_string(),
            size,
            mtime: 0,
        }
    }

    #[tokio::test]
    async fn missing_from_is_a_set_difference_on_hashes() {
        let index = StorageIndex::new();
        index
            .insert(
                "aa",
                IndexEntry {
                    size: 1,
                    path: "aa/aa".into(),
                },
            )
            .await;

        let manifest = FileManifest::from_entries(vec![entry("aa", 1), entry("bb", 2)], 0);
        let missing = index.missing_from(&manifest).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].hash, "bb");

        // unchanged index: same answer
        let again = index.missing_from(&manifest).await;
        assert_eq!(missing, again);
    }

    #[tokio::test]
    async fn empty_markers_are_tracked_separately() {
        let index = StorageIndex::new();
        index.mark_empty("ab/abcd").await;
        assert!(index.is_empty_marker("ab/abcd").await);
        assert!(!index.is_empty_marker("cd/cdef").await);
    }
}
