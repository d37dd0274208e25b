use crate::api_client::Origin;
use crate::error::NodeError;
use crate::storage::StorageBackend;
use crate::utils::{hash_to_filename, sha256_hex, validate_file};
use common::{FileEntry, FileManifest, SyncConfig};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Operator-supplied concurrency is clamped to this bound.
pub const MAX_SYNC_CONCURRENCY: usize = 20;

/// Attempts per file before it counts as failed for the pass.
pub const SYNC_RETRIES: usize = 10;

/// Concurrency actually applied: the operator override clamped to
/// [1, MAX], otherwise the control-plane hint.
pub fn effective_concurrency(override_concurrency: Option<usize>, hint: usize) -> usize {
    match override_concurrency {
        Some(n) if n >= 1 => n.min(MAX_SYNC_CONCURRENCY),
        _ => hint.clamp(1, MAX_SYNC_CONCURRENCY),
    }
}

/// Backoff before retry `attempt` (1-based): doubling from one second,
/// capped at a minute.
fn retry_backoff(attempt: usize) -> Duration {
    let secs = 1u64 << (attempt - 1).min(6);
    Duration::from_secs(secs.min(60))
}

/// Diffs a manifest against the storage backend and downloads whatever is
/// missing, bounded-concurrency, hash-verified, with per-file retries.
/// There is no rollback: files that landed stay even when the pass fails.
pub struct SyncEngine {
    storage: Arc<dyn StorageBackend>,
    origin: Arc<dyn Origin>,
    skip_storage_check: bool,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        origin: Arc<dyn Origin>,
        skip_storage_check: bool,
    ) -> Self {
        Self {
            storage,
            origin,
            skip_storage_check,
        }
    }

    pub async fn sync(
        &self,
        manifest: &FileManifest,
        sync_config: &SyncConfig,
        override_concurrency: Option<usize>,
    ) -> Result<(), NodeError> {
        if !self.skip_storage_check && !self.storage.check().await {
            return Err(NodeError::Storage(crate::storage::StorageError::Backend(
                "storage failed its health probe, refusing to sync into it".into(),
            )));
        }
        info!("checking for missing files");
        let missing = self.storage.get_missing_files(manifest).await?;
        if missing.is_empty() {
            info!("no new files");
            return Ok(());
        }
        let total = missing.len();
        let parallel = effective_concurrency(override_concurrency, sync_config.concurrency);
        info!(
            "{total} file(s) missing, syncing from {} with concurrency {parallel}",
            sync_config.source
        );

        let done = AtomicUsize::new(0);
        let failures: usize = futures::stream::iter(missing)
            .map(|entry| {
                let done = &done;
                async move {
                    let failed = !self.sync_one(&entry).await;
                    let now = done.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("sync progress {now}/{total}");
                    failed as usize
                }
            })
            .buffer_unordered(parallel)
            .fold(0, |acc, failed| async move { acc + failed })
            .await;

        if failures > 0 {
            error!("sync finished with {failures} file(s) still missing");
            return Err(NodeError::Sync { failed: failures });
        }
        info!("sync complete");
        Ok(())
    }

    /// Download, verify and store one entry. True on success.
    async fn sync_one(&self, entry: &FileEntry) -> bool {
        let origin_path = entry.path.trim_start_matches('/');
        for attempt in 1..=SYNC_RETRIES {
            match self.attempt(entry, origin_path).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "download of {} failed (attempt {attempt}/{SYNC_RETRIES}): {e}",
                        entry.path
                    );
                    // a failing final hop still gets its chain reported
                    if let NodeError::OriginStatus { redirects, .. } = &e {
                        if !redirects.is_empty() {
                            self.report_chain(entry, redirects, &e.to_string()).await;
                        }
                    }
                    if attempt < SYNC_RETRIES {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                    }
                }
            }
        }
        error!("giving up on {} after {SYNC_RETRIES} attempts", entry.path);
        false
    }

    async fn attempt(&self, entry: &FileEntry, origin_path: &str) -> Result<(), NodeError> {
        let fetched = self.origin.fetch(origin_path).await?;
        if !validate_file(&fetched.body, &entry.hash) {
            // corrupt content is discarded, never written
            if !fetched.redirects.is_empty() {
                self.report_chain(entry, &fetched.redirects, "hash mismatch")
                    .await;
            }
            return Err(NodeError::Integrity {
                path: entry.path.clone(),
                expected: entry.hash.clone(),
                actual: sha256_hex(&fetched.body),
            });
        }
        self.storage
            .write_file(&hash_to_filename(&entry.hash), fetched.body, entry)
            .await?;
        debug!("stored {}", entry.path);
        Ok(())
    }

    /// Fire-and-forget diagnostics; its own failure is swallowed inside
    /// the origin implementation.
    async fn report_chain(&self, entry: &FileEntry, redirects: &[String], error: &str) {
        let mut urls = vec![entry.path.clone()];
        urls.extend_from_slice(redirects);
        self.origin.report_redirects(urls, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::FetchedFile;
    use crate::storage::local::LocalStorage;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory origin; paths absent from `bodies` always return content
    /// that fails verification.
    struct FakeOrigin {
        bodies: HashMap<String, Bytes>,
        fetches: Mutex<Vec<String>>,
        reports: Mutex<usize>,
    }

    impl FakeOrigin {
        fn new(bodies: HashMap<String, Bytes>) -> Self {
            Self {
                bodies,
                fetches: Mutex::new(Vec::new()),
                reports: Mutex::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Origin for FakeOrigin {
        async fn fetch(&self, path: &str) -> Result<FetchedFile, NodeError> {
            self.fetches.lock().unwrap().push(path.to_string());
            let body = self
                .bodies
                .get(path)
                .cloned()
                .unwrap_or_else(|| Bytes::from_static(b"corrupted"));
            Ok(FetchedFile {
                body,
                redirects: vec!["https://mirror.example/f".to_string()],
            })
        }

        async fn report_redirects(&self, _urls: Vec<String>, _error: &str) {
            *self.reports.lock().unwrap() += 1;
        }
    }

    /// Always answers with a non-2xx final hop reached through a redirect.
    struct RefusingOrigin {
        reports: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Origin for RefusingOrigin {
        async fn fetch(&self, path: &str) -> Result<FetchedFile, NodeError> {
            Err(NodeError::OriginStatus {
                status: 502,
                url: format!("https://mirror.example/{path}"),
                redirects: vec![format!("https://mirror.example/{path}")],
            })
        }

        async fn report_redirects(&self, urls: Vec<String>, _error: &str) {
            self.reports.lock().unwrap().push(urls);
        }
    }

    fn entry(path: &str, content: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: sha256_hex(content),
            size: content.len() as u64,
            mtime: 0,
        }
    }

    #[tokio::test]
    async fn empty_missing_set_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));
        let origin = Arc::new(FakeOrigin::new(HashMap::new()));
        let engine = SyncEngine::new(storage, origin.clone(), false);

        let manifest = FileManifest::from_entries(Vec::new(), 0);
        let cfg = SyncConfig {
            source: "origin".into(),
            concurrency: 4,
        };
        engine.sync(&manifest, &cfg, None).await.unwrap();
        assert!(origin.fetches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_successes_and_fails_on_persistent_corruption() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));

        let good_a = entry("/files/a", b"content a");
        let good_b = entry("/files/b", b"content b");
        let bad = entry("/files/broken", b"real content never served");

        let mut bodies = HashMap::new();
        bodies.insert("files/a".to_string(), Bytes::from_static(b"content a"));
        bodies.insert("files/b".to_string(), Bytes::from_static(b"content b"));
        let origin = Arc::new(FakeOrigin::new(bodies));

        let engine = SyncEngine::new(storage.clone(), origin.clone(), false);
        let manifest = FileManifest::from_entries(
            vec![good_a.clone(), good_b.clone(), bad.clone()],
            0,
        );
        let cfg = SyncConfig {
            source: "origin".into(),
            concurrency: 4,
        };

        let err = engine.sync(&manifest, &cfg, None).await.unwrap_err();
        match err {
            NodeError::Sync { failed } => assert_eq!(failed, 1),
            other => panic!("unexpected error: {other}"),
        }

        // the two good files landed, the corrupt one was never written
        assert!(storage.exists(&hash_to_filename(&good_a.hash)).await.unwrap());
        assert!(storage.exists(&hash_to_filename(&good_b.hash)).await.unwrap());
        assert!(!storage.exists(&hash_to_filename(&bad.hash)).await.unwrap());

        // the corrupt file exhausted every attempt and reported its chain
        let fetches = origin.fetches.lock().unwrap();
        let broken_fetches = fetches.iter().filter(|p| *p == "files/broken").count();
        assert_eq!(broken_fetches, SYNC_RETRIES);
        assert_eq!(*origin.reports.lock().unwrap(), SYNC_RETRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_final_hop_reports_its_redirect_chain() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));
        let origin = Arc::new(RefusingOrigin {
            reports: Mutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(storage, origin.clone(), false);

        let e = entry("/files/a", b"content a");
        let manifest = FileManifest::from_entries(vec![e.clone()], 0);
        let cfg = SyncConfig {
            source: "origin".into(),
            concurrency: 4,
        };
        engine.sync(&manifest, &cfg, None).await.unwrap_err();

        let reports = origin.reports.lock().unwrap();
        assert_eq!(reports.len(), SYNC_RETRIES);
        assert_eq!(
            reports[0],
            vec![
                "/files/a".to_string(),
                "https://mirror.example/files/a".to_string(),
            ]
        );
    }

    #[test]
    fn concurrency_clamping() {
        assert_eq!(effective_concurrency(None, 8), 8);
        assert_eq!(effective_concurrency(None, 500), MAX_SYNC_CONCURRENCY);
        assert_eq!(effective_concurrency(Some(4), 8), 4);
        assert_eq!(effective_concurrency(Some(64), 8), MAX_SYNC_CONCURRENCY);
        assert_eq!(effective_concurrency(Some(0), 8), 8);
        assert_eq!(effective_concurrency(None, 0), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(4), Duration::from_secs(8));
        assert_eq!(retry_backoff(10), Duration::from_secs(60));
    }
}
