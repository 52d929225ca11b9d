use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::CirrusError;

/// Periodically wake warm instances of every database and flush the ones
/// whose change counter reached the threshold.
pub async fn keep_warm_loop(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "keep-warm loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.changed() => {
                info!("keep-warm loop shutting down");
                break;
            }
        }

        let databases = match orchestrator.databases().await {
            Ok(databases) => databases,
            Err(e) => {
                warn!(error = %e, "failed to list databases for keep-warm");
                continue;
            }
        };
        debug!(database_count = databases.len(), "keep-warm tick");

        for database in &databases {
            tick(&orchestrator, database).await;
        }
    }
}

async fn tick(orchestrator: &Orchestrator, database: &str) {
    let manager = match orchestrator.manager(database).await {
        Ok(manager) => manager,
        Err(e) => {
            warn!(database, error = %e, "failed to load database");
            return;
        }
    };

    match manager.wake_up_workers().await {
        Ok(woken) => debug!(database, woken, "woke workers"),
        Err(e) => warn!(database, error = %e, "wake-up failed"),
    }

    match manager.stored_changes().await {
        Ok(stored) if stored >= manager.max_changes_count() => {
            info!(database, stored, "triggering flush");
            match manager.flush().await {
                Ok(outcome) => info!(
                    database,
                    flushed = outcome.flushed,
                    last_flush = outcome.last_flush,
                    "flush completed"
                ),
                Err(CirrusError::FlushInProgress { .. }) => {
                    debug!(database, "flush already running")
                }
                Err(e) => warn!(database, error = %e, "flush failed"),
            }
        }
        Ok(stored) => debug!(database, stored, "flush not needed"),
        Err(e) => warn!(database, error = %e, "failed to read change counter"),
    }
}
