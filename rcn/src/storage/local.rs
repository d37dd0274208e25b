use crate::storage::{
    EXISTS_CACHE_TTL, GcSummary, IndexEntry, MEASURE_PREFIX, SCAN_CONCURRENCY, ServeBody,
    ServeReply, StorageBackend, StorageError, StorageIndex,
};
use crate::utils::parse_range;
use bytes::Bytes;
use common::{FileEntry, FileManifest};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Content store on the node's own disk. The only backend that streams
/// bytes itself instead of redirecting.
pub struct LocalStorage {
    root: PathBuf,
    index: StorageIndex,
    exists_cache: moka::future::Cache<String, ()>,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            index: StorageIndex::new(),
            exists_cache: moka::future::Cache::builder()
                .time_to_live(EXISTS_CACHE_TTL)
                .build(),
        }
    }

    fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// One pass over the namespace with a bounded number of concurrent
    /// directory reads. Regular files matching a wanted hash by name and
    /// size are recorded in the index and dropped from `wanted`.
    async fn scan_into_index(
        &self,
        wanted: &mut HashMap<String, FileEntry>,
    ) -> Result<(), StorageError> {
        let mut queue = vec![self.root.clone()];
        while !queue.is_empty() {
            let mut next_queue = Vec::new();
            let mut in_flight = FuturesUnordered::new();
            let mut pending = queue.into_iter();

            loop {
                while in_flight.len() < SCAN_CONCURRENCY {
                    match pending.next() {
                        Some(dir) => in_flight.push(read_dir_entries(dir)),
                        None => break,
                    }
                }
                let Some(listed) = in_flight.next().await else {
                    break;
                };
                for (path, meta) in listed? {
                    if meta.is_dir() {
                        next_queue.push(path);
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if let Some(entry) = wanted.get(name) {
                        if entry.size == meta.len() {
                            let rel = self.relative(&path);
                            self.index
                                .insert(name, IndexEntry {
                                    size: meta.len(),
                                    path: rel,
                                })
                                .await;
                            wanted.remove(name);
                        }
                    }
                }
            }
            queue = next_queue;
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

async fn read_dir_entries(
    dir: PathBuf,
) -> Result<Vec<(PathBuf, std::fs::Metadata)>, StorageError> {
    let mut out = Vec::new();
    let mut rd = fs::read_dir(&dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let meta = entry.metadata().await?;
        out.push((entry.path(), meta));
    }
    Ok(out)
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn check(&self) -> bool {
        let probe = self.abs(".check");
        let write = fs::write(&probe, chrono::Utc::now().timestamp_millis().to_string()).await;
        let cleanup = fs::remove_file(&probe).await;
        if let Err(e) = &cleanup {
            warn!("failed to remove storage probe: {e}");
        }
        match write {
            Ok(()) => true,
            Err(e) => {
                warn!("storage check failed: {e}");
                false
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        if self.index.is_empty_marker(path).await {
            return Ok(true);
        }
        if self.exists_cache.get(path).await.is_some() {
            return Ok(true);
        }
        let exists = fs::try_exists(self.abs(path)).await?;
        if exists {
            self.exists_cache.insert(path.to_string(), ()).await;
        }
        Ok(exists)
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        meta: &FileEntry,
    ) -> Result<(), StorageError> {
        if content.is_empty() {
            self.index.mark_empty(path).await;
            // indexed like any other object so the next diff skips it
            self.index
                .insert(&meta.hash, IndexEntry {
                    size: 0,
                    path: path.to_string(),
                })
                .await;
            return Ok(());
        }
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&abs, &content).await?;
        self.index
            .insert(&meta.hash, IndexEntry {
                size: content.len() as u64,
                path: path.to_string(),
            })
            .await;
        Ok(())
    }

    async fn get_missing_files(
        &self,
        manifest: &FileManifest,
    ) -> Result<Vec<FileEntry>, StorageError> {
        if self.index.is_warm().await {
            return Ok(self.index.missing_from(manifest).await);
        }
        let mut wanted: HashMap<String, FileEntry> = manifest
            .entries
            .iter()
            .map(|e| (e.hash.clone(), e.clone()))
            .collect();
        if fs::try_exists(&self.root).await? {
            self.scan_into_index(&mut wanted).await?;
        }
        let mut missing: Vec<FileEntry> = wanted.into_values().collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(missing)
    }

    async fn gc(&self, manifest: &FileManifest) -> Result<GcSummary, StorageError> {
        let keep = manifest.hash_set();
        let mut summary = GcSummary::default();
        let mut queue = vec![self.root.clone()];
        while let Some(dir) = queue.pop() {
            let rel = self.relative(&dir);
            if rel.starts_with(MEASURE_PREFIX.trim_end_matches('/')) {
                continue;
            }
            let listed = match read_dir_entries(dir).await {
                Ok(listed) => listed,
                Err(e) => {
                    // degrade to skip-this-pass for unreadable subtrees
                    warn!("gc: skipping unreadable directory: {e}");
                    continue;
                }
            };
            for (path, meta) in listed {
                if meta.is_dir() {
                    queue.push(path);
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || keep.contains(name) {
                    continue;
                }
                debug!("gc: removing {}", path.display());
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("gc: failed to remove {}: {e}", path.display());
                    continue;
                }
                self.index.remove(name).await;
                summary.count += 1;
                summary.bytes_freed += meta.len();
            }
        }
        Ok(summary)
    }

    async fn express(
        &self,
        hash_path: &str,
        range: Option<&str>,
    ) -> Result<ServeReply, StorageError> {
        if self.index.is_empty_marker(hash_path).await {
            return Ok(ServeReply {
                body: ServeBody::Empty,
                bytes: 0,
                hits: 1,
            });
        }
        let file = fs::File::open(self.abs(hash_path)).await?;
        let total = file.metadata().await?.len();
        let (offset, length) = match range.and_then(|h| parse_range(h, total)) {
            Some(r) => (r.start, r.len()),
            None => (0, total),
        };
        Ok(ServeReply {
            body: ServeBody::File {
                file,
                offset,
                length,
                total,
            },
            bytes: length,
            hits: 1,
        })
    }

    fn get_absolute_path(&self, _path: &str) -> Result<String, StorageError> {
        // local disk has no redirect semantics
        Err(StorageError::Unsupported("get_absolute_path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, hash: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: hash.to_string(),
            size,
            mtime: 0,
        }
    }

    fn storage(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn check_writes_and_removes_a_probe() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        assert!(s.check().await);
        assert!(!dir.path().join(".check").exists());
    }

    #[tokio::test]
    async fn write_then_exists_then_not_missing() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        let e = entry("/files/a", "aa11", 5);
        s.write_file("aa/aa11", Bytes::from_static(b"hello"), &e)
            .await
            .unwrap();

        assert!(s.exists("aa/aa11").await.unwrap());
        let manifest = FileManifest::from_entries(vec![e], 0);
        assert!(s.get_missing_files(&manifest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cold_scan_populates_index_and_diff_is_idempotent() {
        let dir = TempDir::new().unwrap();
        // pre-existing content written by an earlier process
        std::fs::create_dir_all(dir.path().join("aa")).unwrap();
        std::fs::write(dir.path().join("aa/aa11"), b"hello").unwrap();

        let s = storage(&dir);
        let manifest = FileManifest::from_entries(
            vec![entry("/files/a", "aa11", 5), entry("/files/b", "bb22", 3)],
            0,
        );
        let missing = s.get_missing_files(&manifest).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].hash, "bb22");

        // warm index: same answer, no I/O dependence
        let again = s.get_missing_files(&manifest).await.unwrap();
        assert_eq!(missing, again);
    }

    #[tokio::test]
    async fn size_mismatch_counts_as_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("aa")).unwrap();
        std::fs::write(dir.path().join("aa/aa11"), b"truncated").unwrap();

        let s = storage(&dir);
        let manifest = FileManifest::from_entries(vec![entry("/files/a", "aa11", 500)], 0);
        let missing = s.get_missing_files(&manifest).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn gc_removes_unlisted_files_but_spares_measure() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        for (path, hash) in [("aa/aaaa", "aaaa"), ("bb/bbbb", "bbbb"), ("cc/cccc", "cccc")] {
            s.write_file(path, Bytes::from_static(b"x"), &entry(path, hash, 1))
                .await
                .unwrap();
        }
        std::fs::create_dir_all(dir.path().join("measure")).unwrap();
        std::fs::write(dir.path().join("measure/10MB"), b"probe").unwrap();

        let manifest = FileManifest::from_entries(
            vec![entry("/files/a", "aaaa", 1), entry("/files/b", "bbbb", 1)],
            0,
        );
        let summary = s.gc(&manifest).await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.bytes_freed, 1);
        assert!(!dir.path().join("cc/cccc").exists());
        assert!(dir.path().join("measure/10MB").exists());
    }

    #[tokio::test]
    async fn empty_content_becomes_a_marker_without_a_physical_write() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        let e = entry("/files/empty", "ee00", 0);
        s.write_file("ee/ee00", Bytes::new(), &e).await.unwrap();

        assert!(!dir.path().join("ee/ee00").exists());
        assert!(s.exists("ee/ee00").await.unwrap());
        let reply = s.express("ee/ee00", None).await.unwrap();
        assert!(matches!(reply.body, ServeBody::Empty));
        assert_eq!(reply.bytes, 0);
        assert_eq!(reply.hits, 1);
    }

    #[tokio::test]
    async fn empty_write_is_not_listed_missing_afterwards() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        let empty = entry("/files/empty", "ee00", 0);
        let full = entry("/files/a", "aa11", 5);
        s.write_file("ee/ee00", Bytes::new(), &empty).await.unwrap();
        s.write_file("aa/aa11", Bytes::from_static(b"hello"), &full)
            .await
            .unwrap();

        let manifest = FileManifest::from_entries(vec![empty, full], 0);
        assert!(s.get_missing_files(&manifest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn express_honors_byte_ranges() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        s.write_file(
            "aa/aa11",
            Bytes::from_static(b"0123456789"),
            &entry("/files/a", "aa11", 10),
        )
        .await
        .unwrap();

        let reply = s.express("aa/aa11", Some("bytes=2-5")).await.unwrap();
        assert_eq!(reply.bytes, 4);
        match reply.body {
            ServeBody::File {
                offset,
                length,
                total,
                ..
            } => {
                assert_eq!((offset, length, total), (2, 4, 10));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn absolute_path_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        assert!(matches!(
            s.get_absolute_path("aa/aa11"),
            Err(StorageError::Unsupported(_))
        ));
    }
}
