use crate::config::Config;
use crate::storage::{
    EXISTS_CACHE_TTL, GcSummary, IndexEntry, SCAN_CONCURRENCY, ServeBody, ServeReply,
    StorageBackend, StorageError, StorageIndex,
};
use crate::utils::served_size;
use bytes::Bytes;
use common::{FileEntry, FileManifest};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::{Method, StatusCode, Url};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One entry of a Depth:1 PROPFIND listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Server-absolute href, e.g. `/dav/rcn/aa/aa11`.
    pub href: String,
    pub is_dir: bool,
    pub size: u64,
}

impl DavEntry {
    pub fn basename(&self) -> &str {
        self.href.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }
}

/// Minimal WebDAV client over reqwest: PUT/GET/HEAD/DELETE/MKCOL plus a
/// Depth:1 PROPFIND listing. Server certificates are not verified, the
/// same stance the node takes on its QUIC control channel.
pub struct DavClient {
    http: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl DavClient {
    pub fn new(
        url: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, StorageError> {
        let base = Url::parse(url)
            .map_err(|e| StorageError::Backend(format!("invalid webdav url: {e}")))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base,
            username,
            password,
        })
    }

    /// Resolve a server-absolute href against the endpoint origin.
    fn href_url(&self, href: &str) -> Result<Url, StorageError> {
        self.base
            .join(href)
            .map_err(|e| StorageError::Backend(format!("bad href `{href}`: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    pub async fn put(&self, href: &str, content: Bytes) -> Result<(), StorageError> {
        let res = self
            .request(Method::PUT, self.href_url(href)?)
            .body(content)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(StorageError::Backend(format!(
                "PUT {href} returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    pub async fn delete(&self, href: &str) -> Result<(), StorageError> {
        let res = self
            .request(Method::DELETE, self.href_url(href)?)
            .send()
            .await?;
        if !res.status().is_success() && res.status() != StatusCode::NOT_FOUND {
            return Err(StorageError::Backend(format!(
                "DELETE {href} returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    pub async fn head(&self, href: &str) -> Result<Option<u64>, StorageError> {
        let res = self
            .request(Method::HEAD, self.href_url(href)?)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(StorageError::Backend(format!(
                "HEAD {href} returned {}",
                res.status()
            )));
        }
        Ok(Some(res.content_length().unwrap_or(0)))
    }

    pub async fn mkcol(&self, href: &str) -> Result<(), StorageError> {
        let method = Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method");
        let res = self.request(method, self.href_url(href)?).send().await?;
        // 405 means the collection already exists
        if !res.status().is_success() && res.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Err(StorageError::Backend(format!(
                "MKCOL {href} returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    /// Depth:1 listing of one collection. The listed collection itself is
    /// excluded from the result.
    pub async fn list(&self, href: &str) -> Result<Vec<DavEntry>, StorageError> {
        let method = Method::from_bytes(b"PROPFIND").expect("PROPFIND is a valid method");
        let res = self
            .request(method, self.href_url(href)?)
            .header("Depth", "1")
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(StorageError::Backend(format!(
                "PROPFIND {href} returned {}",
                res.status()
            )));
        }
        let body = res.text().await?;
        let own = href.trim_end_matches('/');
        Ok(parse_multistatus(&body)
            .into_iter()
            .filter(|e| e.href.trim_end_matches('/') != own)
            .collect())
    }

    /// Directly fetchable URL with the credentials embedded, the classic
    /// DAV download-link form.
    pub fn download_link(&self, href: &str) -> Result<String, StorageError> {
        let mut url = self.href_url(href)?;
        if let Some(user) = &self.username {
            url.set_username(user)
                .map_err(|_| StorageError::Backend("cannot embed username".into()))?;
            url.set_password(self.password.as_deref())
                .map_err(|_| StorageError::Backend("cannot embed password".into()))?;
        }
        Ok(url.to_string())
    }
}

/// Tolerant scan of a PROPFIND multistatus body. Full XML machinery is not
/// warranted for the three fields we read; prefixes and casing vary by
/// server, so tags are matched by local name only.
pub fn parse_multistatus(xml: &str) -> Vec<DavEntry> {
    let mut entries = Vec::new();
    let lower = xml.to_ascii_lowercase();
    let mut at = 0;
    while let Some(start) = find_tag(&lower, "response", at) {
        let end = match find_tag_close(&lower, "response", start) {
            Some(end) => end,
            None => break,
        };
        let block = &xml[start..end];
        let block_lower = &lower[start..end];
        if let Some(href) = tag_content(block, block_lower, "href") {
            // only the resourcetype element decides, an href containing
            // "collection" must not
            let is_dir = tag_content(block, block_lower, "resourcetype")
                .map(|rt| rt.to_ascii_lowercase().contains("collection"))
                .unwrap_or(false)
                || href.ends_with('/');
            let size = tag_content(block, block_lower, "getcontentlength")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            entries.push(DavEntry {
                href: percent_decode(href.trim()),
                is_dir,
                size,
            });
        }
        at = end;
    }
    entries
}

/// Offset just past the opening `<...name...>` tag with the given local
/// name, starting at `from`. Prefixed forms (`<d:name>`) match too.
fn find_tag(lower: &str, name: &str, from: usize) -> Option<usize> {
    let mut at = from;
    while let Some(pos) = lower[at..].find('<').map(|p| at + p) {
        let rest = &lower[pos + 1..];
        let tag_end = rest.find('>')? + pos + 1;
        let tag = &lower[pos + 1..tag_end];
        if !tag.starts_with('/') {
            let local = tag
                .split_whitespace()
                .next()
                .unwrap_or("")
                .rsplit(':')
                .next()
                .unwrap_or("");
            if local == name {
                return Some(tag_end + 1);
            }
        }
        at = tag_end + 1;
    }
    None
}

fn find_tag_close(lower: &str, name: &str, from: usize) -> Option<usize> {
    let mut at = from;
    while let Some(pos) = lower[at..].find("</").map(|p| at + p) {
        let rest = &lower[pos + 2..];
        let tag_end = rest.find('>')? + pos + 2;
        let local = lower[pos + 2..tag_end].rsplit(':').next().unwrap_or("");
        if local == name {
            return Some(pos);
        }
        at = tag_end + 1;
    }
    None
}

fn tag_content<'a>(block: &'a str, block_lower: &str, name: &str) -> Option<&'a str> {
    let start = find_tag(block_lower, name, 0)?;
    let end = find_tag_close(block_lower, name, start)?;
    Some(&block[start..end])
}

fn percent_decode(href: &str) -> String {
    let mut out = Vec::with_capacity(href.len());
    let bytes = href.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&href[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// WebDAV-backed content store. Serves by redirecting clients to the
/// backend's own download link.
pub struct WebdavStorage {
    pub(crate) client: DavClient,
    pub(crate) base_href: String,
    pub(crate) index: StorageIndex,
    exists_cache: moka::future::Cache<String, ()>,
}

impl WebdavStorage {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let url = config
            .storage_url
            .as_deref()
            .ok_or_else(|| StorageError::Backend("webdav backend requires a url".into()))?;
        let client = DavClient::new(
            url,
            config.storage_username.clone(),
            config.storage_password.clone(),
        )?;
        let base = Url::parse(url)
            .map_err(|e| StorageError::Backend(format!("invalid webdav url: {e}")))?;
        let base_href = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            config.storage_base_path.trim_matches('/')
        );
        Ok(Self {
            client,
            base_href,
            index: StorageIndex::new(),
            exists_cache: moka::future::Cache::builder()
                .time_to_live(EXISTS_CACHE_TTL)
                .build(),
        })
    }

    pub(crate) fn href(&self, path: &str) -> String {
        format!("{}/{}", self.base_href, path.trim_start_matches('/'))
    }

    fn is_measure_href(&self, href: &str) -> bool {
        href.trim_end_matches('/')
            .strip_prefix(&self.base_href)
            .map(|rest| rest.trim_start_matches('/').starts_with("measure"))
            .unwrap_or(false)
    }

    /// Size known to the index, falling back to a HEAD against the
    /// backend for files written by an earlier process.
    pub(crate) async fn size_of(&self, hash_path: &str) -> u64 {
        let hash = hash_path.rsplit('/').next().unwrap_or(hash_path);
        if let Some(size) = self.index.size_of(hash).await {
            return size;
        }
        match self.client.head(&self.href(hash_path)).await {
            Ok(Some(size)) => size,
            Ok(None) => 0,
            Err(e) => {
                warn!("failed to stat {hash_path}: {e}");
                0
            }
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for WebdavStorage {
    async fn init(&self) -> Result<(), StorageError> {
        if self.client.head(&self.base_href).await?.is_none() {
            debug!("creating webdav base collection {}", self.base_href);
            self.client.mkcol(&self.base_href).await?;
        }
        Ok(())
    }

    async fn check(&self) -> bool {
        let probe = self.href(".check");
        let payload = chrono::Utc::now().timestamp_millis().to_string();
        let write = self.client.put(&probe, Bytes::from(payload)).await;
        if let Err(e) = self.client.delete(&probe).await {
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
        let exists = self.client.head(&self.href(path)).await?.is_some();
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
            // DAV servers commonly reject empty payloads
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
        self.client.put(&self.href(path), content).await?;
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

        let mut queue = vec![self.base_href.clone()];
        let mut scanned = 0usize;
        while !queue.is_empty() {
            let mut next_queue = Vec::new();
            let mut in_flight = FuturesUnordered::new();
            let mut pending = queue.into_iter();
            loop {
                while in_flight.len() < SCAN_CONCURRENCY {
                    match pending.next() {
                        Some(dir) => in_flight.push(async move {
                            self.client.list(&dir).await
                        }),
                        None => break,
                    }
                }
                let Some(listed) = in_flight.next().await else {
                    break;
                };
                scanned += 1;
                trace!("scanned {scanned} webdav collections");
                for entry in listed? {
                    if entry.is_dir {
                        next_queue.push(entry.href);
                        continue;
                    }
                    let name = entry.basename().to_string();
                    if let Some(want) = wanted.get(&name) {
                        if want.size == entry.size {
                            self.index
                                .insert(&name, IndexEntry {
                                    size: entry.size,
                                    path: entry.href.clone(),
                                })
                                .await;
                            wanted.remove(&name);
                        }
                    }
                }
            }
            queue = next_queue;
        }
        let mut missing: Vec<FileEntry> = wanted.into_values().collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(missing)
    }

    async fn gc(&self, manifest: &FileManifest) -> Result<GcSummary, StorageError> {
        let keep = manifest.hash_set();
        let mut summary = GcSummary::default();
        let mut queue = vec![self.base_href.clone()];
        while let Some(dir) = queue.pop() {
            if self.is_measure_href(&dir) {
                continue;
            }
            let listed = match self.client.list(&dir).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!("gc: skipping unlistable collection {dir}: {e}");
                    continue;
                }
            };
            for entry in listed {
                if entry.is_dir {
                    queue.push(entry.href);
                    continue;
                }
                let name = entry.basename().to_string();
                if name.starts_with('.') || keep.contains(name.as_str()) {
                    continue;
                }
                debug!("gc: removing {}", entry.href);
                if let Err(e) = self.client.delete(&entry.href).await {
                    warn!("gc: failed to remove {}: {e}", entry.href);
                    continue;
                }
                self.index.remove(&name).await;
                summary.count += 1;
                summary.bytes_freed += entry.size;
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
        let location = self.client.download_link(&self.href(hash_path))?;
        let bytes = served_size(self.size_of(hash_path).await, range);
        Ok(ServeReply {
            body: ServeBody::Redirect { location },
            bytes,
            hits: 1,
        })
    }

    fn get_absolute_path(&self, path: &str) -> Result<String, StorageError> {
        self.client.download_link(&self.href(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/rcn/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/rcn/aa/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/rcn/aa/aa11</D:href>
    <D:propstat><D:prop>
      <D:resourcetype/>
      <D:getcontentlength>1234</D:getcontentlength>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn parses_nginx_style_multistatus() {
        let entries = parse_multistatus(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_dir);
        assert!(entries[1].is_dir);
        let file = &entries[2];
        assert!(!file.is_dir);
        assert_eq!(file.href, "/dav/rcn/aa/aa11");
        assert_eq!(file.size, 1234);
        assert_eq!(file.basename(), "aa11");
    }

    #[test]
    fn parses_lowercase_prefixed_variant() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"><d:response>
            <d:href>/dav/space%20name/bb22</d:href>
            <d:propstat><d:prop><d:resourcetype/>
            <d:getcontentlength>7</d:getcontentlength></d:prop></d:propstat>
        </d:response></d:multistatus>"#;
        let entries = parse_multistatus(xml);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].href, "/dav/space name/bb22");
        assert_eq!(entries[0].size, 7);
    }

    #[test]
    fn collection_substring_in_href_does_not_make_a_directory() {
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response>
            <D:href>/dav/rcn/collections/cc33</D:href>
            <D:propstat><D:prop><D:resourcetype/>
            <D:getcontentlength>9</D:getcontentlength></D:prop></D:propstat>
        </D:response></D:multistatus>"#;
        let entries = parse_multistatus(xml);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].size, 9);
    }

    #[test]
    fn list_excludes_the_requested_collection_itself() {
        let own = "/dav/rcn";
        let entries: Vec<DavEntry> = parse_multistatus(SAMPLE)
            .into_iter()
            .filter(|e| e.href.trim_end_matches('/') != own)
            .collect();
        assert_eq!(entries.len(), 2);
    }
}
