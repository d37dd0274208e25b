use crate::config::Config;
use crate::storage::{
    EXISTS_CACHE_TTL, GcSummary, IndexEntry, MEASURE_PREFIX, ServeBody, ServeReply,
    StorageBackend, StorageError, StorageIndex,
};
use crate::utils::served_size;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use common::{FileEntry, FileManifest};
use reqwest::Url;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const PRESIGN_TTL: Duration = Duration::from_secs(60);

/// S3-compatible object store. The endpoint is configured as one url of
/// the form `http(s)://ACCESS:SECRET@host:port/bucket/prefix?region=r`.
pub struct MinioStorage {
    client: Client,
    bucket: String,
    prefix: String,
    custom_host: Option<String>,
    index: StorageIndex,
    exists_cache: moka::future::Cache<String, ()>,
}

impl MinioStorage {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let url = config
            .storage_url
            .as_deref()
            .ok_or_else(|| StorageError::Backend("minio backend requires a url".into()))?;
        let url = Url::parse(url)
            .map_err(|e| StorageError::Backend(format!("invalid minio url: {e}")))?;

        let access_key = url.username().to_string();
        let secret_key = url.password().unwrap_or_default().to_string();
        let region = url
            .query_pairs()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| "us-east-1".to_string());
        let endpoint = format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str()
                .ok_or_else(|| StorageError::Backend("minio url is missing a host".into()))?,
            url.port().map(|p| format!(":{p}")).unwrap_or_default()
        );

        let mut segments = url.path().split('/').filter(|s| !s.is_empty());
        let bucket = segments
            .next()
            .ok_or_else(|| StorageError::Backend("minio url is missing a bucket".into()))?
            .to_string();
        let prefix = segments.collect::<Vec<_>>().join("/");

        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "rcn-config",
            ))
            .region(Region::new(region))
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket,
            prefix,
            custom_host: config.storage_custom_host.clone(),
            index: StorageIndex::new(),
            exists_cache: moka::future::Cache::builder()
                .time_to_live(EXISTS_CACHE_TTL)
                .build(),
        })
    }

    fn key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.trim_start_matches('/').to_string()
        } else {
            format!("{}/{}", self.prefix, path.trim_start_matches('/'))
        }
    }

    /// Key with the configured prefix stripped, for GC accounting.
    fn relative(&self, key: &str) -> String {
        key.strip_prefix(&self.prefix)
            .unwrap_or(key)
            .trim_start_matches('/')
            .to_string()
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(out.content_length().unwrap_or(0) as u64)),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Ok(None)
                } else {
                    Err(StorageError::Backend(service.to_string()))
                }
            }
        }
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.into_service_error().to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.into_service_error().to_string()))?;
        Ok(())
    }

    /// All objects under the configured prefix as (key, size) pairs.
    async fn list_all(&self) -> Result<Vec<(String, u64)>, StorageError> {
        let mut out = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::Backend(e.into_service_error().to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    out.push((key.to_string(), object.size().unwrap_or(0) as u64));
                }
            }
        }
        Ok(out)
    }

    async fn presign(&self, key: &str) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(PRESIGN_TTL)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Backend(e.into_service_error().to_string()))?;
        Ok(presigned.uri().to_string())
    }
}

#[async_trait::async_trait]
impl StorageBackend for MinioStorage {
    async fn check(&self) -> bool {
        let probe = self.key(".check");
        let payload = chrono::Utc::now().timestamp_millis().to_string();
        let write = self.put(&probe, Bytes::from(payload)).await;
        if let Err(e) = self.delete(&probe).await {
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
        let exists = self.head(&self.key(path)).await?.is_some();
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
            self.index
                .insert(&meta.hash, IndexEntry {
                    size: 0,
                    path: path.to_string(),
                })
                .await;
            return Ok(());
        }
        let size = content.len() as u64;
        self.put(&self.key(path), content).await?;
        self.index
            .insert(&meta.hash, IndexEntry {
                size,
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
        for (key, size) in self.list_all().await? {
            let name = key.rsplit('/').next().unwrap_or(&key).to_string();
            if let Some(want) = wanted.get(&name) {
                if want.size == size {
                    self.index
                        .insert(&name, IndexEntry {
                            size,
                            path: self.relative(&key),
                        })
                        .await;
                    wanted.remove(&name);
                }
            }
        }
        let mut missing: Vec<FileEntry> = wanted.into_values().collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(missing)
    }

    async fn gc(&self, manifest: &FileManifest) -> Result<GcSummary, StorageError> {
        let keep = manifest.hash_set();
        let mut summary = GcSummary::default();
        for (key, size) in self.list_all().await? {
            let rel = self.relative(&key);
            if rel.starts_with(MEASURE_PREFIX) {
                continue;
            }
            let name = key.rsplit('/').next().unwrap_or(&key);
            if name.starts_with('.') || keep.contains(name) {
                continue;
            }
            debug!("gc: removing {key}");
            if let Err(e) = self.delete(&key).await {
                warn!("gc: failed to remove {key}: {e}");
                continue;
            }
            self.index.remove(name).await;
            summary.count += 1;
            summary.bytes_freed += size;
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
        let key = self.key(hash_path);
        let location = match &self.custom_host {
            Some(host) => format!("{}/{}", host.trim_end_matches('/'), key),
            None => self.presign(&key).await?,
        };
        let total = match self.index.size_of(
            hash_path.rsplit('/').next().unwrap_or(hash_path),
        )
        .await
        {
            Some(size) => size,
            None => self.head(&key).await?.unwrap_or(0),
        };
        Ok(ServeReply {
            body: ServeBody::Redirect { location },
            bytes: served_size(total, range),
            hits: 1,
        })
    }

    fn get_absolute_path(&self, path: &str) -> Result<String, StorageError> {
        match &self.custom_host {
            Some(host) => Ok(format!(
                "{}/{}",
                host.trim_end_matches('/'),
                self.key(path)
            )),
            None => Err(StorageError::Unsupported("get_absolute_path")),
        }
    }
}
