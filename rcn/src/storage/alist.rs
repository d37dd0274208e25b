use crate::config::Config;
use crate::storage::webdav::WebdavStorage;
use crate::storage::{
    GcSummary, ServeBody, ServeReply, StorageBackend, StorageError,
};
use crate::utils::served_size;
use bytes::Bytes;
use common::{FileEntry, FileManifest};
use std::time::Duration;
use tracing::debug;

/// WebDAV behind an index layer (alist-style) answers GET with a redirect
/// to the real object host. This variant memoizes that upstream redirect
/// target per path so repeated requests skip the upstream negotiation.
pub struct AlistWebdavStorage {
    inner: WebdavStorage,
    /// Client that does not follow redirects; we classify them ourselves.
    probe: reqwest::Client,
    redirect_cache: moka::future::Cache<String, String>,
}

impl AlistWebdavStorage {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let inner = WebdavStorage::new(config)?;
        let probe = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner,
            probe,
            redirect_cache: moka::future::Cache::builder()
                .time_to_live(Duration::from_secs(config.storage_cache_ttl))
                .build(),
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for AlistWebdavStorage {
    async fn init(&self) -> Result<(), StorageError> {
        self.inner.init().await
    }

    async fn check(&self) -> bool {
        self.inner.check().await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        meta: &FileEntry,
    ) -> Result<(), StorageError> {
        self.inner.write_file(path, content, meta).await
    }

    async fn get_missing_files(
        &self,
        manifest: &FileManifest,
    ) -> Result<Vec<FileEntry>, StorageError> {
        self.inner.get_missing_files(manifest).await
    }

    async fn gc(&self, manifest: &FileManifest) -> Result<GcSummary, StorageError> {
        self.inner.gc(manifest).await
    }

    async fn express(
        &self,
        hash_path: &str,
        range: Option<&str>,
    ) -> Result<ServeReply, StorageError> {
        if self.inner.index.is_empty_marker(hash_path).await {
            return Ok(ServeReply {
                body: ServeBody::Empty,
                bytes: 0,
                hits: 1,
            });
        }
        let bytes = served_size(self.inner.size_of(hash_path).await, range);

        // cache hit: replay the upstream Location without touching upstream
        if let Some(location) = self.redirect_cache.get(hash_path).await {
            return Ok(ServeReply {
                body: ServeBody::Redirect { location },
                bytes,
                hits: 1,
            });
        }

        let url = self
            .inner
            .client
            .download_link(&self.inner.href(hash_path))?;
        let mut req = self.probe.get(&url);
        if let Some(r) = range {
            req = req.header(reqwest::header::RANGE, r);
        }
        let res = req.send().await?;
        let status = res.status();

        if status.is_success() {
            // small object served inline by the index layer
            let body = res.bytes().await?;
            let len = body.len() as u64;
            return Ok(ServeReply {
                body: ServeBody::Upstream {
                    status: status.as_u16(),
                    location: None,
                    body,
                },
                bytes: len,
                hits: 1,
            });
        }

        if status.is_redirection() {
            if let Some(location) = res
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            {
                debug!("caching redirect target for {hash_path}");
                self.redirect_cache
                    .insert(hash_path.to_string(), location.clone())
                    .await;
                return Ok(ServeReply {
                    body: ServeBody::Upstream {
                        status: status.as_u16(),
                        location: Some(location),
                        body: Bytes::new(),
                    },
                    bytes,
                    hits: 1,
                });
            }
        }

        // anything else is propagated verbatim and not counted as a hit
        let body = res.bytes().await.unwrap_or_default();
        Ok(ServeReply {
            body: ServeBody::Upstream {
                status: status.as_u16(),
                location: None,
                body,
            },
            bytes: 0,
            hits: 0,
        })
    }

    fn get_absolute_path(&self, path: &str) -> Result<String, StorageError> {
        self.inner.get_absolute_path(path)
    }
}
