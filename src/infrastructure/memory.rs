use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Infrastructure, InfrastructureStorage, InfrastructureUpdate};
use crate::error::{CirrusError, Result};

/// In-process infrastructure records. Updates run under the map entry's
/// lock, so concurrent writers are serialized per database.
#[derive(Debug, Default)]
pub struct MemoryInfrastructureStorage {
    records: DashMap<String, Infrastructure>,
}

impl MemoryInfrastructureStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InfrastructureStorage for MemoryInfrastructureStorage {
    async fn get(&self, database: &str) -> Result<Option<Infrastructure>> {
        Ok(self.records.get(database).map(|r| r.value().clone()))
    }

    async fn set(&self, infrastructure: &Infrastructure) -> Result<()> {
        self.records
            .insert(infrastructure.name().to_string(), infrastructure.clone());
        Ok(())
    }

    async fn remove(&self, database: &str) -> Result<()> {
        self.records.remove(database);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn update(&self, database: &str, apply: InfrastructureUpdate<'_>) -> Result<Infrastructure> {
        let mut record = self
            .records
            .get_mut(database)
            .ok_or_else(|| CirrusError::DatabaseNotFound {
                database: database.to_string(),
            })?;
        // Work on a copy so a failing closure leaves the record untouched.
        let mut next = record.value().clone();
        apply(&mut next)?;
        *record.value_mut() = next.clone();
        Ok(next)
    }

    async fn deploy(&self, infrastructure: &Infrastructure) -> Result<()> {
        match self.records.entry(infrastructure.name().to_string()) {
            Entry::Occupied(_) => Err(CirrusError::DatabaseAlreadyExists {
                database: infrastructure.name().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(infrastructure.clone());
                Ok(())
            }
        }
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
                partitions: 1,
                secret_tokens: Vec::new(),
                statistics: None,
            },
            ScalingTargetConfiguration::default(),
            &DeploymentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_deploy_get_destroy() {
        let storage = MemoryInfrastructureStorage::new();
        storage.deploy(&infrastructure("a")).await.unwrap();
        assert!(matches!(
            storage.deploy(&infrastructure("a")).await,
            Err(CirrusError::DatabaseAlreadyExists { .. })
        ));
        storage.deploy(&infrastructure("b")).await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["a", "b"]);

        storage.destroy("a").await.unwrap();
        assert!(!storage.exists("a").await.unwrap());
        assert!(matches!(
            storage.destroy("a").await,
            Err(CirrusError::DatabaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record() {
        let storage = MemoryInfrastructureStorage::new();
        storage.deploy(&infrastructure("a")).await.unwrap();
        let err = storage
            .update("a", &|infra| {
                infra.stored_changes = 99;
                Err(CirrusError::Validation("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CirrusError::Validation(_)));
        assert_eq!(storage.get_stored_changes("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stored_changes_counter() {
        let storage = MemoryInfrastructureStorage::new();
        storage.deploy(&infrastructure("a")).await.unwrap();
        assert_eq!(storage.add_stored_changes("a", 3).await.unwrap(), 3);
        assert_eq!(storage.add_stored_changes("a", 2).await.unwrap(), 5);
        storage.set_stored_changes("a", 1).await.unwrap();
        assert_eq!(storage.get_stored_changes("a").await.unwrap(), 1);
        assert!(storage.add_stored_changes("missing", 1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_process_state_keeps_every_instance() {
        let storage = Arc::new(MemoryInfrastructureStorage::new());
        storage.deploy(&infrastructure("a")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let state = WorkerState {
                    instance_id: format!("instance-{i}"),
                    partition_index: 0,
                    last_update: i,
                    last_snapshot: None,
                    memory_used: 0,
                    memory_limit: 0,
                    ephemeral_used: 0,
                    ephemeral_limit: 0,
                };
                storage.process_state("a", "a-p0-primary", &state).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let infra = storage.get("a").await.unwrap().unwrap();
        assert_eq!(infra.partitions[0].lambdas[0].instances.len(), 50);
        assert_eq!(infra.min_watermark(0), Some(0));
    }
}
