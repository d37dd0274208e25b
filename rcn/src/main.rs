use anyhow::Context;
use clap::Parser;
use rcn::api_client::{ApiClient, Origin};
use rcn::channel::{ControlPlane, QuicChannel};
use rcn::cluster::ClusterController;
use rcn::config::{Args, Config};
use rcn::keepalive::KeepAliveSupervisor;
use rcn::notify::{Notifier, NullNotifier, WebhookNotifier};
use rcn::storage::make_storage;
use rcn::sync::SyncEngine;
use rcn::token::TokenManager;
use rcn::{PROTOCOL_VERSION, user_agent};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the manifest is re-checked for updates while serving.
const MANIFEST_RECHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// A graceful shutdown slower than this is abandoned.
const SHUTDOWN_BOUND: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Arc::new(Config::from_args(args)?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!(
        "rcn {} starting (protocol {PROTOCOL_VERSION}, storage `{}`)",
        env!("CARGO_PKG_VERSION"),
        config.storage
    );

    let tokens = Arc::new(TokenManager::new(
        &config.server_url,
        &config.cluster_id,
        &config.cluster_secret,
        &user_agent(),
    )?);
    // fail fast on bad credentials before anything else starts
    tokens
        .get_token()
        .await
        .context("credential exchange with the control plane failed")?;

    let api = Arc::new(ApiClient::new(&config.server_url, tokens.clone(), &user_agent())?);
    let storage = make_storage(&config)?;

    let rpc_addr: SocketAddr = config
        .rpc_addr
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("could not resolve rpc address `{}`", config.rpc_addr))?;
    let server_name = config
        .rpc_addr
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| "localhost".to_string());
    let (channel, events) = QuicChannel::new(rpc_addr, server_name, tokens.clone())?;
    let control: Arc<dyn ControlPlane> = Arc::new(channel);

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            config
                .cluster_name
                .clone()
                .unwrap_or_else(|| config.cluster_id.clone()),
        )),
        None => Arc::new(NullNotifier),
    };

    let origin: Arc<dyn Origin> = api.clone();
    let cluster = ClusterController::new(
        config.clone(),
        control.clone(),
        storage.clone(),
        origin,
        notifier,
    );
    cluster.init().await?;
    cluster.spawn_event_consumer(events);
    cluster
        .connect()
        .await
        .context("could not establish the control channel")?;

    if config.byoc {
        if config.ssl_cert.is_some() {
            let (cert, _) = cluster.use_self_cert().await?;
            info!("using operator TLS material, certificate at {}", cert.display());
        } else {
            info!("byoc without local material, TLS terminates in front of this node");
        }
    } else {
        let (cert, _) = cluster.request_cert().await?;
        info!("certificate issued by control plane, persisted at {}", cert.display());
    }

    let app = rcn::api::create_router(cluster.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("could not bind port {}", config.port))?;
    info!("listening on {}", listener.local_addr()?);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("http server stopped: {e}");
        }
    });
    cluster.mark_listening();

    cluster
        .port_check()
        .await
        .context("control plane could not reach the advertised endpoint")?;

    let agent_config = api.get_configuration().await?;
    let manifest = Arc::new(api.get_file_list(None).await?);
    cluster.set_manifest(manifest.clone()).await;

    let sync_engine = SyncEngine::new(storage.clone(), api.clone(), config.skip_storage_check);
    sync_engine
        .sync(&manifest, &agent_config.sync, config.sync_concurrency)
        .await?;
    cluster.mark_synced();
    cluster.gc_background(manifest.clone());

    cluster.enable().await?;
    let keepalive = KeepAliveSupervisor::new(cluster.clone(), control.clone()).spawn();

    let refresher = {
        let cluster = cluster.clone();
        let api = api.clone();
        let sync_config = agent_config.sync.clone();
        let config = config.clone();
        tokio::spawn(async move {
            loop {
                time::sleep(MANIFEST_RECHECK_INTERVAL).await;
                let current = cluster.manifest().await;
                let update = match api.get_file_list(current.latest_mtime()).await {
                    Ok(update) => update,
                    Err(e) => {
                        warn!("manifest re-check failed: {e}");
                        continue;
                    }
                };
                if update.is_empty() {
                    continue;
                }
                info!("manifest changed, {} updated entries", update.len());
                let merged = Arc::new(current.merged(&update));
                let engine =
                    SyncEngine::new(cluster.storage.clone(), api.clone(), config.skip_storage_check);
                if let Err(e) = engine
                    .sync(&merged, &sync_config, config.sync_concurrency)
                    .await
                {
                    warn!("incremental sync incomplete, keeping old snapshot: {e}");
                    continue;
                }
                cluster.set_manifest(merged.clone()).await;
                cluster.gc_background(merged);
            }
        })
    };

    shutdown_signal().await;
    info!("shutting down");
    keepalive.abort();
    refresher.abort();
    server.abort();

    // a second signal during teardown force-exits
    let forced = tokio::spawn(async {
        shutdown_signal().await;
        error!("second signal, exiting immediately");
        std::process::exit(1);
    });
    if time::timeout(SHUTDOWN_BOUND, cluster.exit()).await.is_err() {
        error!("graceful shutdown timed out");
        std::process::exit(1);
    }
    forced.abort();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
