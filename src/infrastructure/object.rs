use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{Infrastructure, InfrastructureStorage, InfrastructureUpdate};
use crate::error::{CirrusError, Result};
use crate::storage::{CirrusStore, ObjectVersion};

/// Maximum CAS retry attempts for infrastructure updates.
const MAX_CAS_RETRIES: u32 = 10;

/// Upper bound of the random pause between CAS attempts.
const CAS_JITTER_MS: u64 = 20;

/// Infrastructure records at `{db}/infrastructure.json`, updated with
/// ETag compare-and-swap.
#[derive(Clone)]
pub struct ObjectInfrastructureStorage {
    store: CirrusStore,
}

impl ObjectInfrastructureStorage {
    pub fn new(store: CirrusStore) -> Self {
        Self { store }
    }

    pub fn key(database: &str) -> String {
        format!("{database}/infrastructure.json")
    }

    async fn read_versioned(&self, database: &str) -> Result<Option<(Infrastructure, ObjectVersion)>> {
        match self.store.get_versioned(&Self::key(database)).await {
            Ok((data, version)) => Ok(Some((serde_json::from_slice(&data)?, version))),
            Err(CirrusError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn to_bytes(infrastructure: &Infrastructure) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(infrastructure)?))
    }
}

#[async_trait]
impl InfrastructureStorage for ObjectInfrastructureStorage {
    #[instrument(skip(self), fields(database = database))]
    async fn get(&self, database: &str) -> Result<Option<Infrastructure>> {
        Ok(self.read_versioned(database).await?.map(|(infra, _)| infra))
    }

    #[instrument(skip(self, infrastructure), fields(database = infrastructure.name()))]
    async fn set(&self, infrastructure: &Infrastructure) -> Result<()> {
        self.store
            .put(&Self::key(infrastructure.name()), Self::to_bytes(infrastructure)?)
            .await
    }

    #[instrument(skip(self), fields(database = database))]
    async fn remove(&self, database: &str) -> Result<()> {
        self.store.delete(&Self::key(database)).await
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<String>> {
        let keys = self.store.list_prefix("").await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_suffix("/infrastructure.json"))
            .filter(|db| !db.contains('/'))
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip(self, apply), fields(database = database))]
    async fn update(&self, database: &str, apply: InfrastructureUpdate<'_>) -> Result<Infrastructure> {
        let key = Self::key(database);
        for attempt in 0..MAX_CAS_RETRIES {
            let Some((mut infra, version)) = self.read_versioned(database).await? else {
                return Err(CirrusError::DatabaseNotFound {
                    database: database.to_string(),
                });
            };
            apply(&mut infra)?;

            match self
                .store
                .put_if_match(&key, Self::to_bytes(&infra)?, &version)
                .await
            {
                Ok(()) => {
                    debug!(attempt, "updated infrastructure");
                    return Ok(infra);
                }
                Err(CirrusError::Conflict { .. }) => {
                    warn!(attempt, "infrastructure CAS conflict, retrying");
                    let pause = rand::thread_rng().gen_range(0..=CAS_JITTER_MS);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CirrusError::Conflict { key })
    }

    #[instrument(skip(self, infrastructure), fields(database = infrastructure.name()))]
    async fn deploy(&self, infrastructure: &Infrastructure) -> Result<()> {
        self.store
            .put_if_not_exists(&Self::key(infrastructure.name()), Self::to_bytes(infrastructure)?)
            .await
            .map_err(|e| match e {
                CirrusError::Conflict { .. } => CirrusError::DatabaseAlreadyExists {
                    database: infrastructure.name().to_string(),
                },
                other => other,
            })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfig, ScalingTargetConfiguration};
    use crate::types::DatabaseConfiguration;
    use crate::worker::WorkerState;
    use std::sync::Arc;

    fn infrastructure(name: &str) -> Infrastructure {
        Infrastructure::new(
            DatabaseConfiguration {
                name: name.into(),
                region: "us-east-1".into(),
                dimensions: 2,
                space: Default::default(),
                partitions: 2,
                secret_tokens: Vec::new(),
                statistics: None,
            },
            ScalingTargetConfiguration::default(),
            &DeploymentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_deploy_and_list() {
        let store = CirrusStore::in_memory();
        let storage = ObjectInfrastructureStorage::new(store.clone());
        storage.deploy(&infrastructure("alpha")).await.unwrap();
        storage.deploy(&infrastructure("beta")).await.unwrap();
        // Unrelated objects under a database prefix are not records.
        store.put("alpha/changes/x.json", Bytes::from("{}")).await.unwrap();

        assert!(matches!(
            storage.deploy(&infrastructure("alpha")).await,
            Err(CirrusError::DatabaseAlreadyExists { .. })
        ));
        assert_eq!(storage.list().await.unwrap(), vec!["alpha", "beta"]);

        let infra = storage.get("alpha").await.unwrap().unwrap();
        assert_eq!(infra.partitions.len(), 2);
        assert!(storage.get("gamma").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_database() {
        let storage = ObjectInfrastructureStorage::new(CirrusStore::in_memory());
        let err = storage.add_stored_changes("nope", 1).await.unwrap_err();
        assert!(matches!(err, CirrusError::DatabaseNotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_process_state_keeps_every_instance() {
        let storage = Arc::new(ObjectInfrastructureStorage::new(CirrusStore::in_memory()));
        storage.deploy(&infrastructure("db")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let state = WorkerState {
                    instance_id: format!("instance-{i}"),
                    partition_index: 1,
                    last_update: 100 + i,
                    last_snapshot: None,
                    memory_used: 0,
                    memory_limit: 0,
                    ephemeral_used: 0,
                    ephemeral_limit: 0,
                };
                storage.process_state("db", "db-p1-primary", &state).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let infra = storage.get("db").await.unwrap().unwrap();
        let primary = &infra.partitions[1].lambdas[0];
        assert_eq!(primary.instances.len(), 8);
        assert_eq!(infra.min_watermark(1), Some(100));
        assert_eq!(infra.min_watermark(0), None);
    }
}
