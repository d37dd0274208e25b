use crate::error::NodeError;
use crate::token::TokenManager;
use bytes::Bytes;
use common::{AgentConfiguration, FileManifest};
use reqwest::{StatusCode, Url, header};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound on manually-followed redirect hops for origin downloads.
const MAX_REDIRECTS: usize = 10;

/// A downloaded origin object together with the redirect chain that led to
/// it, kept for diagnostics reporting on repeated failures.
#[derive(Debug)]
pub struct FetchedFile {
    pub body: Bytes,
    pub redirects: Vec<String>,
}

/// Where sync and serve-miss downloads come from. The HTTP client
/// implements it for real; tests substitute an in-memory origin.
#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<FetchedFile, NodeError>;

    /// Best-effort diagnostics: reports a failed download's redirect chain
    /// to the control plane. Must never fail the caller.
    async fn report_redirects(&self, urls: Vec<String>, error: &str);
}

/// Client for the control plane's HTTP API: manifest, configuration,
/// origin downloads and diagnostics reports. Every request carries the
/// bearer token and the node user agent.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        tokens: Arc<TokenManager>,
        user_agent: &str,
    ) -> Result<Self, NodeError> {
        // redirects are followed manually so the chain stays observable
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn authed_get(&self, url: &str) -> Result<reqwest::Response, NodeError> {
        let token = self.tokens.get_token().await?;
        Ok(self.http.get(url).bearer_auth(token).send().await?)
    }

    /// `GET files`, optionally filtered to entries newer than
    /// `last_modified`. A 204 means nothing changed and yields an empty
    /// snapshot.
    pub async fn get_file_list(
        &self,
        last_modified: Option<i64>,
    ) -> Result<FileManifest, NodeError> {
        let mut url = self.url("files");
        if let Some(since) = last_modified {
            url = format!("{url}?lastModified={since}");
        }
        let res = self.authed_get(&url).await?;
        let retrieved_at = chrono::Utc::now().timestamp_millis();
        if res.status() == StatusCode::NO_CONTENT {
            debug!("file list unchanged since {last_modified:?}");
            return Ok(FileManifest::from_entries(Vec::new(), retrieved_at));
        }
        if !res.status().is_success() {
            return Err(NodeError::OriginStatus {
                status: res.status().as_u16(),
                url,
                redirects: Vec::new(),
            });
        }
        let payload = res.bytes().await?;
        let manifest = FileManifest::decode(&payload, retrieved_at)?;
        info!("fetched manifest with {} entries", manifest.len());
        Ok(manifest)
    }

    pub async fn get_configuration(&self) -> Result<AgentConfiguration, NodeError> {
        let url = self.url("configuration");
        let res = self.authed_get(&url).await?;
        if !res.status().is_success() {
            return Err(NodeError::OriginStatus {
                status: res.status().as_u16(),
                url,
                redirects: Vec::new(),
            });
        }
        Ok(res.json().await?)
    }
}

#[async_trait::async_trait]
impl Origin for ApiClient {
    /// Fetch one origin object, following redirects by hand so the chain
    /// is available when an attempt has to be reported.
    async fn fetch(&self, path: &str) -> Result<FetchedFile, NodeError> {
        let mut url = self.url(path);
        let origin_host = Url::parse(&self.base_url).ok().and_then(|u| {
            u.host_str().map(str::to_string)
        });
        let mut redirects = Vec::new();

        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.http.get(&url);
            // the token only goes to the control plane, never to third
            // party mirrors a redirect may point at
            let same_host = Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                == origin_host;
            if same_host {
                req = req.bearer_auth(self.tokens.get_token().await?);
            }
            let res = req.send().await?;

            if res.status().is_redirection() {
                let Some(next) = res
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(NodeError::OriginStatus {
                        status: res.status().as_u16(),
                        url,
                        redirects,
                    });
                };
                let next = match Url::parse(&url).ok().and_then(|u| u.join(next).ok()) {
                    Some(joined) => joined.to_string(),
                    None => next.to_string(),
                };
                redirects.push(next.clone());
                url = next;
                continue;
            }

            if !res.status().is_success() {
                return Err(NodeError::OriginStatus {
                    status: res.status().as_u16(),
                    url,
                    redirects,
                });
            }
            let body = res.bytes().await?;
            return Ok(FetchedFile { body, redirects });
        }
        Err(NodeError::OriginStatus {
            status: StatusCode::LOOP_DETECTED.as_u16(),
            url,
            redirects,
        })
    }

    async fn report_redirects(&self, urls: Vec<String>, error: &str) {
        let token = match self.tokens.get_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("redirect report skipped, no token: {e}");
                return;
            }
        };
        let result = self
            .http
            .post(self.url("report"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "urls": urls,
                "error": error,
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(res) if !res.status().is_success() => {
                warn!("redirect report rejected: {}", res.status());
            }
            Ok(_) => debug!("reported redirect chain"),
            Err(e) => warn!("redirect report failed: {e}"),
        }
    }
}
