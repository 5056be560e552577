use std::sync::Arc;

use channel_engine::config::{Config, StoreKind};
use channel_engine::content::{ContentSource, FileContentSource, HttpContentSource, NoContentSource};
use channel_engine::coordinator::{CoordinatorOptions, SyncCoordinator};
use channel_engine::scheduler::Scheduler;
use channel_engine::store::{RestStore, SharedStateStore, SqliteStore};
use channel_engine::{build_router, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env();

    let store = open_store(&cfg).await;
    let source = content_source(&cfg)?;
    info!("content source: {}", source.describe());

    let coordinator = SyncCoordinator::new(
        store,
        source,
        CoordinatorOptions {
            scheduler: Scheduler::new(cfg.default_duration_secs),
            ttl: cfg.state_ttl,
            store_timeout: cfg.store_timeout,
            refresh_policy: cfg.refresh_policy,
            ffprobe: cfg.probe_durations.then(|| cfg.ffprobe.clone()),
        },
    );

    let state = AppState::new(Arc::new(coordinator));
    info!(instance = %state.instance_id, "channel engine {} starting on http://{}", state.version, cfg.bind);

    let app = build_router(state);

    // Bind loopback by default; put Nginx/Caddy in front for LAN/Internet.
    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// A store that cannot be opened is not fatal: the channel runs on
/// process-local state and `/api/v1/ping` reports it.
async fn open_store(cfg: &Config) -> Option<Arc<dyn SharedStateStore>> {
    match &cfg.store {
        StoreKind::Sqlite { path } => {
            if let Some(dir) = std::path::Path::new(path).parent() {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    warn!("cannot create {}: {e}", dir.display());
                }
            }
            match SqliteStore::open(path.clone()).await {
                Ok(s) => {
                    info!("shared store: sqlite at {path}");
                    Some(Arc::new(s))
                }
                Err(e) => {
                    warn!("failed to open sqlite store at {path}, running process-local: {e}");
                    None
                }
            }
        }
        StoreKind::Rest { url, token } => match RestStore::new(url, token.clone(), cfg.store_timeout) {
            Ok(s) => {
                info!("shared store: rest at {url}");
                Some(Arc::new(s))
            }
            Err(e) => {
                warn!("failed to build rest store client, running process-local: {e}");
                None
            }
        },
        StoreKind::Memory => None,
    }
}

fn content_source(cfg: &Config) -> anyhow::Result<Arc<dyn ContentSource>> {
    if let Some(url) = &cfg.catalog_url {
        return Ok(Arc::new(HttpContentSource::new(url.clone(), cfg.store_timeout.max(std::time::Duration::from_secs(10)))?));
    }
    if let Some(path) = &cfg.catalog_file {
        return Ok(Arc::new(FileContentSource::new(path.clone())));
    }
    warn!("no CHANNEL_CATALOG_FILE or CHANNEL_CATALOG_URL; refresh yields an empty catalog");
    Ok(Arc::new(NoContentSource))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
