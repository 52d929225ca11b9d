//! Database registry and RPC dispatch.
//!
//! The orchestrator owns one [`IndexManager`] per database, created lazily
//! from the infrastructure record, and routes every [`OrchestratorCommand`]
//! to it after checking the caller's token.

pub mod commands;
pub mod keep_warm;
pub mod manager;
pub mod merge;
pub mod storage;

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{CirrusError, Result};
use crate::infrastructure::{
    Infrastructure, InfrastructureStorage, MemoryInfrastructureStorage, ObjectInfrastructureStorage,
};
use crate::partition::LocalWorkerPool;
use crate::storage::CirrusStore;
use crate::types::DatabaseConfiguration;

pub use commands::{InitializeArgs, OrchestratorCommand, OrchestratorRequest};
pub use manager::{FlushOutcome, IndexManager, ManagerSettings, WriteOutcome};
pub use merge::merge_results;
pub use storage::StorageFactory;

pub struct Orchestrator {
    config: Arc<Config>,
    storage: Arc<StorageFactory>,
    pool: Arc<LocalWorkerPool>,
    infrastructure: Arc<dyn InfrastructureStorage>,
    managers: DashMap<String, Arc<IndexManager>>,
    settings: ManagerSettings,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: CirrusStore) -> Self {
        let infrastructure: Arc<dyn InfrastructureStorage> = if config.storage.backend == "memory" {
            Arc::new(MemoryInfrastructureStorage::new())
        } else {
            Arc::new(ObjectInfrastructureStorage::new(store.clone()))
        };
        let storage = Arc::new(StorageFactory::new(store, &config));
        let pool = Arc::new(LocalWorkerPool::new(storage.clone()));
        Self {
            settings: ManagerSettings::from_config(&config),
            config,
            storage,
            pool,
            infrastructure,
            managers: DashMap::new(),
        }
    }

    pub fn store(&self) -> &CirrusStore {
        self.storage.store()
    }

    pub fn pool(&self) -> &Arc<LocalWorkerPool> {
        &self.pool
    }

    pub fn infrastructure(&self) -> &Arc<dyn InfrastructureStorage> {
        &self.infrastructure
    }

    pub async fn databases(&self) -> Result<Vec<String>> {
        self.infrastructure.list().await
    }

    /// Manager of an initialized database.
    pub async fn manager(&self, database: &str) -> Result<Arc<IndexManager>> {
        if let Some(manager) = self.managers.get(database) {
            return Ok(manager.value().clone());
        }
        let infra =
            self.infrastructure
                .get(database)
                .await?
                .ok_or_else(|| CirrusError::DatabaseNotFound {
                    database: database.to_string(),
                })?;
        let manager = Arc::new(IndexManager::new(
            infra.configuration,
            self.storage.changes(database),
            self.infrastructure.clone(),
            self.pool.clone(),
            self.settings.clone(),
        ));
        Ok(self
            .managers
            .entry(database.to_string())
            .or_insert(manager)
            .value()
            .clone())
    }

    /// Run one RPC call and return its JSON result.
    #[instrument(skip(self, request), fields(database = %request.database_name, method = request.command.method()))]
    pub async fn dispatch(&self, request: OrchestratorRequest) -> Result<Value> {
        let OrchestratorRequest {
            database_name: database,
            secret_token,
            command,
        } = request;
        validate_database_name(&database)?;

        match command {
            OrchestratorCommand::Ping => return Ok(json!("pong")),
            OrchestratorCommand::Initialize(args) => {
                let configuration = self.initialize(&database, args).await?;
                return Ok(serde_json::to_value(configuration)?);
            }
            _ => {}
        }

        let manager = self.manager(&database).await?;
        let token = secret_token.as_deref();
        if !command.is_public() {
            manager.authorize(token).await?;
        }

        let value = match command {
            OrchestratorCommand::Query(query) => serde_json::to_value(manager.query(query).await?)?,
            OrchestratorCommand::AddVectors(args) => {
                serde_json::to_value(manager.add(args.vectors).await?)?
            }
            OrchestratorCommand::RemoveVectors(args) => {
                serde_json::to_value(manager.remove(args.labels).await?)?
            }
            OrchestratorCommand::Count => serde_json::to_value(manager.count().await?)?,
            OrchestratorCommand::GetConfiguration => {
                serde_json::to_value(manager.configuration().await?)?
            }
            OrchestratorCommand::AddToken(args) => {
                serde_json::to_value(manager.add_token(&args.name).await?)?
            }
            OrchestratorCommand::RemoveToken(args) => {
                manager.remove_token(&args.name).await?;
                Value::Null
            }
            OrchestratorCommand::Auth => match manager.authorize(token).await {
                Ok(()) => json!(true),
                Err(CirrusError::Unauthorized { .. }) => json!(false),
                Err(e) => return Err(e),
            },
            OrchestratorCommand::WakeUpWorkers => Value::from(manager.wake_up_workers().await?),
            OrchestratorCommand::Flush => serde_json::to_value(manager.flush().await?)?,
            OrchestratorCommand::Destroy => {
                self.destroy(&database).await?;
                Value::Null
            }
            OrchestratorCommand::Ping | OrchestratorCommand::Initialize(_) => Value::Null,
        };
        Ok(value)
    }

    /// Create a database and lay out its lambdas.
    #[instrument(skip(self, args), fields(database = %database, dimensions = args.dimensions, partitions = args.partitions))]
    pub async fn initialize(
        &self,
        database: &str,
        args: InitializeArgs,
    ) -> Result<DatabaseConfiguration> {
        validate_database_name(database)?;
        if args.dimensions == 0 {
            return Err(CirrusError::Validation("dimensions must be > 0".into()));
        }
        if args.partitions == 0 {
            return Err(CirrusError::Validation("partitions must be > 0".into()));
        }

        let configuration = DatabaseConfiguration {
            name: database.to_string(),
            region: args
                .region
                .unwrap_or_else(|| self.config.deployment.region.clone()),
            dimensions: args.dimensions,
            space: args.space,
            partitions: args.partitions,
            secret_tokens: Vec::new(),
            statistics: args.statistics,
        };
        let scaling = args.scaling.unwrap_or_else(|| self.config.scaling.clone());
        let infra = Infrastructure::new(configuration.clone(), scaling, &self.config.deployment);
        self.infrastructure.deploy(&infra).await?;
        info!(
            region = %configuration.region,
            lambdas = infra.partitions.iter().map(|p| p.lambdas.len()).sum::<usize>(),
            "database initialized"
        );
        Ok(configuration)
    }

    /// Remove a database: its record, log, snapshots and running instances.
    #[instrument(skip(self), fields(database = %database))]
    pub async fn destroy(&self, database: &str) -> Result<()> {
        let infra =
            self.infrastructure
                .get(database)
                .await?
                .ok_or_else(|| CirrusError::DatabaseNotFound {
                    database: database.to_string(),
                })?;
        self.infrastructure.destroy(database).await?;
        self.managers.remove(database);
        self.pool.evict(
            infra
                .partitions
                .iter()
                .flat_map(|p| p.lambdas.iter())
                .map(|l| l.name.as_str()),
        );
        let deleted = self.storage.store().delete_prefix(&format!("{database}/")).await?;
        self.storage.forget(database);

        let scratch = self.config.worker.scratch_dir.join(database);
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %scratch.display(), error = %e, "failed to remove scratch directory");
            }
        }
        info!(deleted, "database destroyed");
        Ok(())
    }
}

/// Database names are path segments in the object store and part of
/// lambda names.
pub fn validate_database_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name.as_bytes()[0].is_ascii_alphanumeric()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(CirrusError::Validation(format!(
            "invalid database name '{name}': must be 1-255 characters of [A-Za-z0-9-_.] starting with a letter or digit"
        )))
    }
}
