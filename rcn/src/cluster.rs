use crate::api_client::Origin;
use crate::channel::{ChannelEvent, ControlPlane};
use crate::config::Config;
use crate::error::NodeError;
use crate::notify::{LifecycleEvent, Notifier};
use crate::storage::StorageBackend;
use crate::utils::{hash_to_filename, sha256_hex, validate_file};
use common::{EnableRequest, FileEntry, FileManifest, PortCheckRequest};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Where the node stands in its lifecycle. Purely informational: the
/// controller methods are guarded by the atomics, not by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Initialized,
    Connected,
    CertReady,
    Listening,
    Synced,
    Enabled,
    Disabled,
    Exited,
}

/// Served hits and bytes since the last acknowledged keepalive.
#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn record(&self, hits: u64, bytes: u64) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// Subtract exactly what a keepalive reported, keeping traffic served
    /// while the report was in flight. Saturates rather than wrapping.
    pub fn subtract(&self, snapshot: CounterSnapshot) {
        let _ = self
            .hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(snapshot.hits))
            });
        let _ = self
            .bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(snapshot.bytes))
            });
    }
}

/// Owns the node lifecycle: registration, serving state, the on-demand
/// download path and the counters the keepalive reports.
pub struct ClusterController {
    pub config: Arc<Config>,
    control: Arc<dyn ControlPlane>,
    pub storage: Arc<dyn StorageBackend>,
    origin: Arc<dyn Origin>,
    notifier: Arc<dyn Notifier>,
    pub counters: Counters,
    /// The operator's intent; survives transport drops.
    want_enabled: AtomicBool,
    /// Whether the control plane currently routes traffic to us.
    enabled: AtomicBool,
    state: StdMutex<NodeState>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    manifest: RwLock<Arc<FileManifest>>,
}

impl ClusterController {
    pub fn new(
        config: Arc<Config>,
        control: Arc<dyn ControlPlane>,
        storage: Arc<dyn StorageBackend>,
        origin: Arc<dyn Origin>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            control,
            storage,
            origin,
            notifier,
            counters: Counters::default(),
            want_enabled: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            state: StdMutex::new(NodeState::Idle),
            inflight: Mutex::new(HashMap::new()),
            manifest: RwLock::new(Arc::new(FileManifest::from_entries(Vec::new(), 0))),
        })
    }

    fn set_state(&self, next: NodeState) {
        let mut state = self.state.lock().unwrap();
        debug!("node state {:?} -> {next:?}", *state);
        *state = next;
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn init(&self) -> Result<(), NodeError> {
        self.storage.init().await?;
        self.set_state(NodeState::Initialized);
        Ok(())
    }

    /// Establish and authenticate the control channel up front, so bad
    /// transport configuration fails here and not mid-registration.
    pub async fn connect(&self) -> Result<(), NodeError> {
        self.control.connect().await?;
        self.set_state(NodeState::Connected);
        Ok(())
    }

    /// Fetch TLS material from the control plane and persist it under the
    /// scratch directory for whatever terminates TLS in front of us.
    pub async fn request_cert(&self) -> Result<(PathBuf, PathBuf), NodeError> {
        let bundle = self.control.request_cert().await?;
        let paths = self.persist_cert(&bundle.cert, &bundle.key).await?;
        self.set_state(NodeState::CertReady);
        Ok(paths)
    }

    /// Bring-your-own-certificate: the operator supplied either file paths
    /// or inline PEM. Inline material is persisted under the scratch
    /// directory first.
    pub async fn use_self_cert(&self) -> Result<(PathBuf, PathBuf), NodeError> {
        let cert = self.config.ssl_cert.clone().ok_or_else(|| {
            NodeError::Registration("byoc requires RCN_SSL_CERT".into())
        })?;
        let key = self.config.ssl_key.clone().ok_or_else(|| {
            NodeError::Registration("byoc requires RCN_SSL_KEY".into())
        })?;
        let paths = if cert.contains("-----BEGIN") {
            self.persist_cert(&cert, &key).await?
        } else {
            (PathBuf::from(cert), PathBuf::from(key))
        };
        self.set_state(NodeState::CertReady);
        Ok(paths)
    }

    async fn persist_cert(&self, cert: &str, key: &str) -> Result<(PathBuf, PathBuf), NodeError> {
        fs::create_dir_all(&self.config.tmp_dir).await?;
        let cert_path = self.config.tmp_dir.join("cert.pem");
        let key_path = self.config.tmp_dir.join("key.pem");
        fs::write(&cert_path, cert).await?;
        fs::write(&key_path, key).await?;
        Ok((cert_path, key_path))
    }

    pub fn mark_listening(&self) {
        self.set_state(NodeState::Listening);
    }

    pub fn mark_synced(&self) {
        self.set_state(NodeState::Synced);
    }

    /// Ask the control plane to probe our advertised endpoint before we
    /// register for traffic.
    pub async fn port_check(&self) -> Result<(), NodeError> {
        self.control
            .port_check(PortCheckRequest {
                host: self.config.public_host.clone(),
                port: self.config.public_port,
                version: crate::PROTOCOL_VERSION.to_string(),
            })
            .await
    }

    /// Register for traffic. Idempotent; a rejected registration is fatal
    /// unless the development override is set.
    pub async fn enable(&self) -> Result<(), NodeError> {
        if self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.want_enabled.store(true, Ordering::SeqCst);
        let request = EnableRequest {
            host: self.config.public_host.clone(),
            port: self.config.public_port,
            version: crate::PROTOCOL_VERSION.to_string(),
            byoc: self.config.byoc,
            no_fast_enable: self.config.no_fast_enable,
            flavor: self.config.flavor(),
        };
        match self.control.enable(request).await {
            Ok(()) => {
                self.enabled.store(true, Ordering::SeqCst);
                self.set_state(NodeState::Enabled);
                info!("node enabled, serving traffic");
                self.notifier.notify(LifecycleEvent::Enabled).await;
                Ok(())
            }
            Err(e) if self.config.no_enable_check => {
                warn!("enable rejected but continuing without registration: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deregister from traffic. Idempotent; failures are logged, never
    /// propagated, so shutdown and restart paths always make progress.
    pub async fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.disable().await {
            warn!("disable reported an error, treating node as disabled anyway: {e}");
        }
        self.set_state(NodeState::Disabled);
        info!("node disabled");
        self.notifier.notify(LifecycleEvent::Disabled).await;
    }

    /// Full re-registration cycle used when keepalives stop getting through.
    /// The channel is torn down in between so the enable runs over a fresh
    /// handshake, never a stale session the control plane may have dropped.
    pub async fn restart(&self, reason: &str) -> Result<(), NodeError> {
        warn!("restarting registration: {reason}");
        self.notifier
            .notify(LifecycleEvent::Restarting {
                reason: reason.to_string(),
            })
            .await;
        self.disable().await;
        self.control.reset().await;
        self.enable().await
    }

    pub async fn set_manifest(&self, manifest: Arc<FileManifest>) {
        *self.manifest.write().await = manifest;
    }

    pub async fn manifest(&self) -> Arc<FileManifest> {
        self.manifest.read().await.clone()
    }

    /// On-demand download for a serve-time cache miss. Single-flight per
    /// hash: concurrent requests for the same object wait for the first
    /// download instead of racing it. Returns false for hashes the current
    /// manifest does not know.
    pub async fn download_file(&self, hash: &str) -> Result<bool, NodeError> {
        let entry = match self.lookup(hash).await {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        let hash_path = hash_to_filename(hash);
        if self.storage.exists(&hash_path).await? {
            // someone else just fetched it
            self.forget_inflight(hash).await;
            return Ok(true);
        }

        let result = self.fetch_and_store(&entry, &hash_path).await;
        self.forget_inflight(hash).await;
        result.map(|()| true)
    }

    async fn fetch_and_store(&self, entry: &FileEntry, hash_path: &str) -> Result<(), NodeError> {
        let fetched = match self.origin.fetch(entry.path.trim_start_matches('/')).await {
            Ok(fetched) => fetched,
            Err(e) => {
                if let NodeError::OriginStatus { redirects, .. } = &e {
                    if !redirects.is_empty() {
                        let mut urls = vec![entry.path.clone()];
                        urls.extend(redirects.iter().cloned());
                        self.origin.report_redirects(urls, &e.to_string()).await;
                    }
                }
                return Err(e);
            }
        };
        if !validate_file(&fetched.body, &entry.hash) {
            if !fetched.redirects.is_empty() {
                let mut urls = vec![entry.path.clone()];
                urls.extend(fetched.redirects.iter().cloned());
                self.origin.report_redirects(urls, "hash mismatch").await;
            }
            return Err(NodeError::Integrity {
                path: entry.path.clone(),
                expected: entry.hash.clone(),
                actual: sha256_hex(&fetched.body),
            });
        }
        self.storage.write_file(hash_path, fetched.body, entry).await?;
        debug!("cache miss filled for {}", entry.path);
        Ok(())
    }

    async fn lookup(&self, hash: &str) -> Option<FileEntry> {
        self.manifest
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.hash == hash)
            .cloned()
    }

    async fn forget_inflight(&self, hash: &str) {
        self.inflight.lock().await.remove(hash);
    }

    /// Garbage collection runs detached so a slow or failing pass never
    /// blocks the serving path.
    pub fn gc_background(self: &Arc<Self>, manifest: Arc<FileManifest>) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.storage.gc(&manifest).await {
                Ok(summary) => {
                    if summary.count > 0 {
                        info!(
                            "gc removed {} file(s), freed {} byte(s)",
                            summary.count, summary.bytes_freed
                        );
                    }
                }
                Err(e) => warn!("gc pass failed: {e}"),
            }
        });
    }

    /// Consume transport events: each reconnect silently dropped our
    /// registration on the control plane, so re-issue the enable while the
    /// operator still wants us serving.
    pub fn spawn_event_consumer(self: &Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Reconnected => {
                        if !this.want_enabled.load(Ordering::SeqCst) {
                            continue;
                        }
                        this.enabled.store(false, Ordering::SeqCst);
                        if let Err(e) = this.enable().await {
                            error!("re-enable after reconnect failed: {e}");
                            this.notifier
                                .notify(LifecycleEvent::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            std::process::exit(1);
                        }
                    }
                }
            }
        });
    }

    /// Graceful teardown: stop wanting traffic, deregister, close the
    /// control channel.
    pub async fn exit(&self) {
        self.want_enabled.store(false, Ordering::SeqCst);
        self.disable().await;
        self.control.close().await;
        self.set_state(NodeState::Exited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::FetchedFile;
    use crate::channel::ControlPlane;
    use crate::notify::NullNotifier;
    use crate::storage::local::LocalStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::{CertBundle, KeepAliveRequest};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    struct MockControl {
        enables: AtomicUsize,
        disables: AtomicUsize,
        resets: AtomicUsize,
        reject_enable: bool,
    }

    impl MockControl {
        fn new(reject_enable: bool) -> Arc<Self> {
            Arc::new(Self {
                enables: AtomicUsize::new(0),
                disables: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                reject_enable,
            })
        }
    }

    #[async_trait]
    impl ControlPlane for MockControl {
        async fn enable(&self, _request: EnableRequest) -> Result<(), NodeError> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            if self.reject_enable {
                Err(NodeError::Registration("rejected".into()))
            } else {
                Ok(())
            }
        }

        async fn disable(&self) -> Result<(), NodeError> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        async fn port_check(&self, _request: PortCheckRequest) -> Result<(), NodeError> {
            Ok(())
        }

        async fn request_cert(&self) -> Result<CertBundle, NodeError> {
            Ok(CertBundle {
                cert: "cert".into(),
                key: "key".into(),
            })
        }

        async fn keep_alive(
            &self,
            _request: KeepAliveRequest,
            _timeout: Duration,
        ) -> Result<Option<i64>, NodeError> {
            Ok(Some(0))
        }

        async fn close(&self) {}
    }

    /// Serves one body for every path, with a pause so concurrent callers
    /// overlap, and counts fetches.
    struct SlowOrigin {
        body: Bytes,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Origin for SlowOrigin {
        async fn fetch(&self, _path: &str) -> Result<FetchedFile, NodeError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(FetchedFile {
                body: self.body.clone(),
                redirects: Vec::new(),
            })
        }

        async fn report_redirects(&self, _urls: Vec<String>, _error: &str) {}
    }

    fn test_config(dir: &TempDir) -> Arc<Config> {
        Arc::new(Config {
            cluster_id: "id".into(),
            cluster_secret: "secret".into(),
            server_url: "https://cp.example".into(),
            rpc_addr: "127.0.0.1:50051".into(),
            port: 4000,
            public_host: None,
            public_port: 4000,
            byoc: false,
            ssl_cert: None,
            ssl_key: None,
            storage: "local".into(),
            storage_root: dir.path().to_path_buf(),
            storage_url: None,
            storage_username: None,
            storage_password: None,
            storage_base_path: "rcn".into(),
            storage_cache_ttl: 3600,
            storage_custom_host: None,
            sync_concurrency: None,
            skip_storage_check: false,
            disable_sync_files: false,
            allow_no_sign: true,
            no_enable_check: false,
            no_fast_enable: false,
            notify_webhook_url: None,
            cluster_name: None,
            tmp_dir: dir.path().join("tmp"),
        })
    }

    fn controller(
        dir: &TempDir,
        control: Arc<MockControl>,
        origin: Arc<SlowOrigin>,
    ) -> Arc<ClusterController> {
        ClusterController::new(
            test_config(dir),
            control,
            Arc::new(LocalStorage::new(dir.path().join("cache"))),
            origin,
            Arc::new(NullNotifier),
        )
    }

    fn origin_with(body: &'static [u8]) -> Arc<SlowOrigin> {
        Arc::new(SlowOrigin {
            body: Bytes::from_static(body),
            fetches: AtomicUsize::new(0),
        })
    }

    #[test]
    fn counters_subtract_only_the_reported_snapshot() {
        let counters = Counters::default();
        counters.record(10, 1000);
        let snap = counters.snapshot();
        // traffic that lands while the report is in flight
        counters.record(3, 300);
        counters.subtract(snap);
        assert_eq!(counters.snapshot(), CounterSnapshot { hits: 3, bytes: 300 });
    }

    #[test]
    fn counters_subtract_saturates() {
        let counters = Counters::default();
        counters.record(1, 10);
        counters.subtract(CounterSnapshot { hits: 5, bytes: 50 });
        assert_eq!(counters.snapshot(), CounterSnapshot { hits: 0, bytes: 0 });
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(false);
        let cluster = controller(&dir, control.clone(), origin_with(b"x"));

        cluster.enable().await.unwrap();
        cluster.enable().await.unwrap();
        assert_eq!(control.enables.load(Ordering::SeqCst), 1);
        assert!(cluster.is_enabled());
    }

    #[tokio::test]
    async fn disable_before_enable_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(false);
        let cluster = controller(&dir, control.clone(), origin_with(b"x"));

        cluster.disable().await;
        assert_eq!(control.disables.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_enable_propagates_without_the_override() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(true);
        let cluster = controller(&dir, control, origin_with(b"x"));

        let err = cluster.enable().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!cluster.is_enabled());
    }

    #[tokio::test]
    async fn restart_tears_down_the_channel_before_reenabling() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(false);
        let cluster = controller(&dir, control.clone(), origin_with(b"x"));

        cluster.enable().await.unwrap();
        cluster.restart("keepalive failure window exceeded").await.unwrap();

        assert_eq!(control.disables.load(Ordering::SeqCst), 1);
        assert_eq!(control.resets.load(Ordering::SeqCst), 1);
        assert_eq!(control.enables.load(Ordering::SeqCst), 2);
        assert!(cluster.is_enabled());
    }

    #[tokio::test]
    async fn concurrent_misses_download_once() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(false);
        let origin = origin_with(b"cached body");
        let cluster = controller(&dir, control, origin.clone());
        cluster.init().await.unwrap();

        let hash = sha256_hex(b"cached body");
        let manifest = Arc::new(FileManifest::from_entries(
            vec![FileEntry {
                path: "/files/thing".into(),
                hash: hash.clone(),
                size: 11,
                mtime: 0,
            }],
            0,
        ));
        cluster.set_manifest(manifest).await;

        let a = {
            let cluster = cluster.clone();
            let hash = hash.clone();
            tokio::spawn(async move { cluster.download_file(&hash).await })
        };
        let b = {
            let cluster = cluster.clone();
            let hash = hash.clone();
            tokio::spawn(async move { cluster.download_file(&hash).await })
        };
        assert!(a.await.unwrap().unwrap());
        assert!(b.await.unwrap().unwrap());

        assert_eq!(origin.fetches.load(Ordering::SeqCst), 1);
        assert!(cluster.storage.exists(&hash_to_filename(&hash)).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_hash_is_not_downloaded() {
        let dir = TempDir::new().unwrap();
        let control = MockControl::new(false);
        let origin = origin_with(b"x");
        let cluster = controller(&dir, control, origin.clone());

        assert!(!cluster.download_file("deadbeef").await.unwrap());
        assert_eq!(origin.fetches.load(Ordering::SeqCst), 0);
    }
}
