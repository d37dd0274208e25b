use crate::cluster::ClusterController;
use crate::storage::{MEASURE_PREFIX, ServeBody, StorageError};
use crate::utils::{check_sign, hash_to_filename, parse_range};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use common::FileEntry;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Largest measurement request, in megabytes.
const MEASURE_LIMIT_MB: u64 = 200;

/// Repeating payload of measurement bodies.
const MEASURE_PATTERN: [u8; 4] = [0x00, 0x66, 0xcc, 0xff];

pub fn create_router(cluster: Arc<ClusterController>) -> Router {
    Router::new()
        .route("/", get(|| async { StatusCode::OK.into_response() }))
        .route("/download/{hash}", get(serve_file))
        .route("/measure/{size}", get(measure))
        .layer(TraceLayer::new_for_http())
        .with_state(cluster)
}

fn status(code: StatusCode, msg: &'static str) -> Response {
    (code, msg).into_response()
}

fn signed(cluster: &ClusterController, path: &str, query: &HashMap<String, String>) -> bool {
    if cluster.config.allow_no_sign {
        return true;
    }
    check_sign(
        path,
        &cluster.config.cluster_secret,
        query,
        chrono::Utc::now().timestamp_millis(),
    )
}

async fn serve_file(
    State(cluster): State<Arc<ClusterController>>,
    Path(hash): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let hash = hash.to_lowercase();
    if hash.len() < 2 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return status(StatusCode::NOT_FOUND, "not found");
    }
    if !signed(&cluster, &format!("/download/{hash}"), &query) {
        return status(StatusCode::FORBIDDEN, "invalid sign");
    }

    let hash_path = hash_to_filename(&hash);
    match cluster.storage.exists(&hash_path).await {
        Ok(true) => {}
        Ok(false) => {
            if cluster.config.disable_sync_files {
                return status(StatusCode::NOT_FOUND, "not found");
            }
            match cluster.download_file(&hash).await {
                Ok(true) => {}
                Ok(false) => return status(StatusCode::NOT_FOUND, "not found"),
                Err(e) => {
                    error!("cache miss fill for {hash} failed: {e}");
                    return status(StatusCode::INTERNAL_SERVER_ERROR, "download failed");
                }
            }
        }
        Err(e) => {
            error!("existence check for {hash} failed: {e}");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "storage error");
        }
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let reply = match cluster.storage.express(&hash_path, range.as_deref()).await {
        Ok(reply) => reply,
        Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return status(StatusCode::NOT_FOUND, "not found");
        }
        Err(e) => {
            error!("serving {hash} failed: {e}");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "storage error");
        }
    };
    cluster.counters.record(reply.hits, reply.bytes);

    match reply.body {
        ServeBody::Empty => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        ServeBody::File {
            mut file,
            offset,
            length,
            total,
        } => {
            if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
                error!("seek in {hash} failed: {e}");
                return status(StatusCode::INTERNAL_SERVER_ERROR, "storage error");
            }
            let stream = ReaderStream::new(file.take(length));
            let ranged = range
                .as_deref()
                .and_then(|h| parse_range(h, total))
                .is_some();
            let builder = if ranged {
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", offset, offset + length - 1, total),
                    )
            } else {
                Response::builder().status(StatusCode::OK)
            };
            builder
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, length)
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        ServeBody::Redirect { location } => Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        ServeBody::Upstream {
            status: upstream,
            location,
            body,
        } => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(upstream).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            if let Some(location) = location {
                builder = builder.header(header::LOCATION, location);
            }
            builder
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Bandwidth probe: `size` megabytes of a fixed byte pattern. Local storage
/// streams it; redirect backends materialize a probe object once and send
/// the client there, so the measured path is the one real downloads take.
async fn measure(
    State(cluster): State<Arc<ClusterController>>,
    Path(size): Path<u64>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !signed(&cluster, &format!("/measure/{size}"), &query) {
        return status(StatusCode::FORBIDDEN, "invalid sign");
    }
    if size > MEASURE_LIMIT_MB {
        return status(StatusCode::BAD_REQUEST, "measurement too large");
    }

    let object = format!("{MEASURE_PREFIX}{size}MB");
    match cluster.storage.get_absolute_path(&object) {
        Ok(_) => match ensure_measure_object(&cluster, &object, size).await {
            Ok(location) => Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, location)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => {
                warn!("measurement object {object} unavailable: {e}");
                status(StatusCode::INTERNAL_SERVER_ERROR, "measure failed")
            }
        },
        Err(StorageError::Unsupported(_)) => {
            let chunk = Bytes::from(measure_chunk());
            let stream = futures::stream::iter(
                (0..size).map(move |_| Ok::<_, std::io::Error>(chunk.clone())),
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, size * 1024 * 1024)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            warn!("measure path lookup failed: {e}");
            status(StatusCode::INTERNAL_SERVER_ERROR, "measure failed")
        }
    }
}

fn measure_chunk() -> Vec<u8> {
    MEASURE_PATTERN
        .iter()
        .copied()
        .cycle()
        .take(1024 * 1024)
        .collect()
}

/// Redirect backends serve the probe from their own namespace; write it on
/// first use since the manifest never declares it and GC never removes it.
async fn ensure_measure_object(
    cluster: &ClusterController,
    object: &str,
    size: u64,
) -> Result<String, StorageError> {
    if !cluster.storage.exists(object).await? {
        let body: Bytes = measure_chunk()
            .into_iter()
            .cycle()
            .take((size * 1024 * 1024) as usize)
            .collect();
        let meta = FileEntry {
            path: format!("/{object}"),
            hash: object.to_string(),
            size: body.len() as u64,
            mtime: 0,
        };
        cluster.storage.write_file(object, body, &meta).await?;
    }
    cluster.storage.get_absolute_path(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{FetchedFile, Origin};
    use crate::channel::ControlPlane;
    use crate::config::Config;
    use crate::error::NodeError;
    use crate::notify::NullNotifier;
    use crate::storage::local::LocalStorage;
    use crate::utils::{compute_sign, encode_expiry, sha256_hex};
    use async_trait::async_trait;
    use common::{
        CertBundle, EnableRequest, FileManifest, KeepAliveRequest, PortCheckRequest,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoopControl;

    #[async_trait]
    impl ControlPlane for NoopControl {
        async fn enable(&self, _request: EnableRequest) -> Result<(), NodeError> {
            Ok(())
        }
        async fn disable(&self) -> Result<(), NodeError> {
            Ok(())
        }
        async fn port_check(&self, _request: PortCheckRequest) -> Result<(), NodeError> {
            Ok(())
        }
        async fn request_cert(&self) -> Result<CertBundle, NodeError> {
            Ok(CertBundle {
                cert: String::new(),
                key: String::new(),
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

    struct NoOrigin;

    #[async_trait]
    impl Origin for NoOrigin {
        async fn fetch(&self, path: &str) -> Result<FetchedFile, NodeError> {
            Err(NodeError::OriginStatus {
                status: 404,
                url: path.to_string(),
                redirects: Vec::new(),
            })
        }
        async fn report_redirects(&self, _urls: Vec<String>, _error: &str) {}
    }

    fn cluster(dir: &TempDir, allow_no_sign: bool) -> Arc<ClusterController> {
        let config = Arc::new(Config {
            cluster_id: "id".into(),
            cluster_secret: "topsecret".into(),
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
            allow_no_sign,
            no_enable_check: false,
            no_fast_enable: false,
            notify_webhook_url: None,
            cluster_name: None,
            tmp_dir: dir.path().join("tmp"),
        });
        ClusterController::new(
            config,
            Arc::new(NoopControl),
            Arc::new(LocalStorage::new(dir.path().join("cache"))),
            Arc::new(NoOrigin),
            Arc::new(NullNotifier),
        )
    }

    async fn store(cluster: &ClusterController, content: &'static [u8]) -> String {
        let hash = sha256_hex(content);
        let entry = FileEntry {
            path: "/files/x".into(),
            hash: hash.clone(),
            size: content.len() as u64,
            mtime: 0,
        };
        cluster
            .storage
            .write_file(&hash_to_filename(&hash), Bytes::from_static(content), &entry)
            .await
            .unwrap();
        cluster
            .set_manifest(Arc::new(FileManifest::from_entries(vec![entry], 0)))
            .await;
        hash
    }

    #[tokio::test]
    async fn unsigned_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, false);
        let hash = store(&cluster, b"hello").await;

        let response = serve_file(
            State(cluster),
            Path(hash),
            Query(HashMap::new()),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn signed_request_is_served_and_counted() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, false);
        let hash = store(&cluster, b"hello").await;

        let expiry = encode_expiry(chrono::Utc::now().timestamp_millis() + 60_000);
        let sign = compute_sign(&format!("/download/{hash}"), "topsecret", &expiry);
        let mut query = HashMap::new();
        query.insert("s".to_string(), sign);
        query.insert("e".to_string(), expiry);

        let response = serve_file(
            State(cluster.clone()),
            Path(hash),
            Query(query),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let snap = cluster.counters.snapshot();
        assert_eq!((snap.hits, snap.bytes), (1, 5));
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, true);

        let response = serve_file(
            State(cluster),
            Path("abcdef0123".to_string()),
            Query(HashMap::new()),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn range_request_gets_partial_content() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, true);
        let hash = store(&cluster, b"0123456789").await;

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());
        let response = serve_file(
            State(cluster.clone()),
            Path(hash),
            Query(HashMap::new()),
            headers,
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 2-5/10"
        );
        assert_eq!(cluster.counters.snapshot().bytes, 4);
    }

    #[tokio::test]
    async fn oversized_measurement_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, true);

        let response = measure(State(cluster), Path(201), Query(HashMap::new())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn local_measurement_streams_the_pattern() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, true);

        let response = measure(State(cluster), Path(1), Query(HashMap::new())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            &(1024 * 1024).to_string()
        );
    }
}
