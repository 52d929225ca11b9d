//! Application bootstrap, kept out of `main.rs` so it can be tested.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::keep_warm::keep_warm_loop;
use crate::orchestrator::Orchestrator;
use crate::server::routes::build_router;
use crate::server::AppState;
use crate::storage::CirrusStore;

/// Resolve the configuration file path.
///
/// Priority:
/// 1. `CIRRUS_CONFIG` environment variable
/// 2. `./cirrus.toml` if it exists
/// 3. None (use defaults)
pub fn resolve_config_path() -> Option<String> {
    std::env::var("CIRRUS_CONFIG").ok().or_else(|| {
        let default = "cirrus.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Install the tracing subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Build the router and spawn the keep-warm loop.
///
/// Returns the router and the sender that stops background tasks.
pub async fn build_app(
    config: Config,
) -> Result<(Router, watch::Sender<bool>), Box<dyn std::error::Error>> {
    tracing::info!("cirrus starting");
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        bucket = %config.storage.bucket,
        backend = %config.storage.backend,
        region = %config.deployment.region,
        fallback_regions = ?config.deployment.fallback_regions,
        scratch_dir = %config.worker.scratch_dir.display(),
        max_changes_count = config.flush.max_changes_count,
        keep_warm_interval_secs = config.flush.keep_warm_interval_secs,
        "configuration loaded"
    );

    crate::metrics::init();

    let store = CirrusStore::from_config(&config.storage)?;
    let config = Arc::new(config);
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), store.clone()));
    match orchestrator.databases().await {
        Ok(databases) => tracing::info!(count = databases.len(), "found existing databases"),
        Err(e) => tracing::warn!(error = %e, "failed to list databases on startup"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(keep_warm_loop(
        orchestrator.clone(),
        Duration::from_secs(config.flush.keep_warm_interval_secs.max(1)),
        shutdown_rx,
    ));

    let state = AppState {
        store,
        orchestrator,
        config,
    };
    Ok((build_router(state), shutdown_tx))
}
