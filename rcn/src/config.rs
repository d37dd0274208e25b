use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Cluster id issued by the control plane
    #[arg(long, env = "RCN_CLUSTER_ID")]
    pub cluster_id: String,

    /// Cluster secret issued by the control plane
    #[arg(long, env = "RCN_CLUSTER_SECRET")]
    pub cluster_secret: String,

    /// Control plane HTTP API base url
    #[arg(
        long,
        env = "RCN_SERVER_URL",
        default_value = "https://cluster.rcn.example.com"
    )]
    pub server_url: String,

    /// Control plane RPC channel address (host:port, QUIC)
    #[arg(long, env = "RCN_RPC_ADDR", default_value = "127.0.0.1:50051")]
    pub rpc_addr: String,

    /// Local listening port
    #[arg(short, long, env = "RCN_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Public address advertised to the control plane, when it differs
    /// from the local interface (e.g. behind a router with a static map)
    #[arg(long, env = "RCN_PUBLIC_HOST")]
    pub public_host: Option<String>,

    /// Public port advertised to the control plane
    #[arg(long, env = "RCN_PUBLIC_PORT")]
    pub public_port: Option<u16>,

    /// Bring-your-own-certificate: skip requesting TLS material
    #[arg(long, env = "RCN_BYOC", default_value_t = false)]
    pub byoc: bool,

    /// Operator-supplied certificate (path or PEM content)
    #[arg(long, env = "RCN_SSL_CERT")]
    pub ssl_cert: Option<String>,

    /// Operator-supplied private key (path or PEM content)
    #[arg(long, env = "RCN_SSL_KEY")]
    pub ssl_key: Option<String>,

    /// Storage backend: local | webdav | alist | minio
    #[arg(long, env = "RCN_STORAGE", default_value = "local")]
    pub storage: String,

    /// Root directory for the local backend
    #[arg(long, env = "RCN_STORAGE_ROOT", default_value = "/var/lib/rcn/cache")]
    pub storage_root: PathBuf,

    /// Backend endpoint url (webdav/alist/minio)
    #[arg(long, env = "RCN_STORAGE_URL")]
    pub storage_url: Option<String>,

    /// Backend username (webdav/alist)
    #[arg(long, env = "RCN_STORAGE_USERNAME")]
    pub storage_username: Option<String>,

    /// Backend password (webdav/alist)
    #[arg(long, env = "RCN_STORAGE_PASSWORD")]
    pub storage_password: Option<String>,

    /// Path prefix inside the backend namespace
    #[arg(long, env = "RCN_STORAGE_BASE_PATH", default_value = "rcn")]
    pub storage_base_path: String,

    /// Redirect-cache TTL in seconds (alist backend)
    #[arg(long, env = "RCN_STORAGE_CACHE_TTL", default_value_t = 3600)]
    pub storage_cache_ttl: u64,

    /// Serve object-store files from this host instead of presigned urls
    #[arg(long, env = "RCN_STORAGE_CUSTOM_HOST")]
    pub storage_custom_host: Option<String>,

    /// Sync concurrency override; the control-plane hint applies when unset
    #[arg(long, env = "RCN_SYNC_CONCURRENCY")]
    pub sync_concurrency: Option<usize>,

    /// Skip the storage health probe before sync
    #[arg(long, env = "RCN_SKIP_STORAGE_CHECK", default_value_t = false)]
    pub skip_storage_check: bool,

    /// Disable on-demand downloads for serve-time cache misses
    #[arg(long, env = "RCN_DISABLE_SYNC_FILES", default_value_t = false)]
    pub disable_sync_files: bool,

    /// Accept unsigned download requests (development only)
    #[arg(long, env = "RCN_ALLOW_NO_SIGN", default_value_t = false)]
    pub allow_no_sign: bool,

    /// Treat a rejected enable as non-fatal (development only)
    #[arg(long, env = "RCN_NO_ENABLE_CHECK", default_value_t = false)]
    pub no_enable_check: bool,

    /// Ask the control plane to fully re-measure this node before enabling
    #[arg(long, env = "RCN_NO_FAST_ENABLE", default_value_t = false)]
    pub no_fast_enable: bool,

    /// Webhook endpoint for lifecycle notifications
    #[arg(long, env = "RCN_NOTIFY_WEBHOOK_URL")]
    pub notify_webhook_url: Option<String>,

    /// Human-readable node name used in notifications
    #[arg(long, env = "RCN_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Directory for TLS material and scratch files
    #[arg(long, env = "RCN_TMP_DIR", default_value = "/tmp/rcn")]
    pub tmp_dir: PathBuf,
}

/// Immutable runtime configuration, built once in `main` and handed to each
/// component explicitly. There is no global configuration singleton.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_id: String,
    pub cluster_secret: String,
    pub server_url: String,
    pub rpc_addr: String,
    pub port: u16,
    pub public_host: Option<String>,
    pub public_port: u16,
    pub byoc: bool,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub storage: String,
    pub storage_root: PathBuf,
    pub storage_url: Option<String>,
    pub storage_username: Option<String>,
    pub storage_password: Option<String>,
    pub storage_base_path: String,
    pub storage_cache_ttl: u64,
    pub storage_custom_host: Option<String>,
    pub sync_concurrency: Option<usize>,
    pub skip_storage_check: bool,
    pub disable_sync_files: bool,
    pub allow_no_sign: bool,
    pub no_enable_check: bool,
    pub no_fast_enable: bool,
    pub notify_webhook_url: Option<String>,
    pub cluster_name: Option<String>,
    pub tmp_dir: PathBuf,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        match args.storage.as_str() {
            "local" => {}
            "webdav" | "alist" | "minio" => {
                if args.storage_url.is_none() {
                    anyhow::bail!(
                        "RCN_STORAGE_URL is required for the `{}` backend",
                        args.storage
                    );
                }
            }
            other => anyhow::bail!("unknown storage backend `{other}`"),
        }

        Ok(Config {
            public_port: args.public_port.unwrap_or(args.port),
            cluster_id: args.cluster_id,
            cluster_secret: args.cluster_secret,
            server_url: args.server_url.trim_end_matches('/').to_string(),
            rpc_addr: args.rpc_addr,
            port: args.port,
            public_host: args.public_host,
            byoc: args.byoc,
            ssl_cert: args.ssl_cert,
            ssl_key: args.ssl_key,
            storage: args.storage,
            storage_root: args.storage_root,
            storage_url: args.storage_url,
            storage_username: args.storage_username,
            storage_password: args.storage_password,
            storage_base_path: args.storage_base_path,
            storage_cache_ttl: args.storage_cache_ttl,
            storage_custom_host: args.storage_custom_host,
            sync_concurrency: args.sync_concurrency,
            skip_storage_check: args.skip_storage_check,
            disable_sync_files: args.disable_sync_files,
            allow_no_sign: args.allow_no_sign,
            no_enable_check: args.no_enable_check,
            no_fast_enable: args.no_fast_enable,
            notify_webhook_url: args.notify_webhook_url,
            cluster_name: args.cluster_name,
            tmp_dir: args.tmp_dir,
        })
    }

    pub fn flavor(&self) -> common::protocol::NodeFlavor {
        common::protocol::NodeFlavor {
            runtime: format!("rcn/{}", env!("CARGO_PKG_VERSION")),
            storage: self.storage.clone(),
        }
    }
}
