pub mod handlers;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::storage::CirrusStore;

/// Shared application state injected into all handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: CirrusStore,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
}
