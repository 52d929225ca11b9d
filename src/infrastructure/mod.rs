//! Per-database deployment record: which lambdas serve each partition and
//! which of their instances are warm, plus the flush bookkeeping.

pub mod memory;
pub mod object;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{DeploymentConfig, ScalingTargetConfiguration};
use crate::error::{CirrusError, Result};
use crate::types::{DatabaseConfiguration, Timestamp};
use crate::worker::WorkerState;

pub use memory::MemoryInfrastructureStorage;
pub use object::ObjectInfrastructureStorage;

/// Instances not heard from for this long are dropped from the record.
pub const INSTANCE_TTL_MS: u64 = 60 * 60 * 1000;

/// A flush claim older than this is considered abandoned.
pub const FLUSH_CLAIM_TTL_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LambdaKind {
    Primary,
    Secondary,
    Fallback,
}

impl LambdaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LambdaKind::Primary => "primary",
            LambdaKind::Secondary => "secondary",
            LambdaKind::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaInstance {
    pub id: String,
    /// Watermark last reported by the instance.
    pub last_updated: Timestamp,
    /// Wall-clock milliseconds of the last report.
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaInfrastructure {
    pub name: String,
    pub region: String,
    #[serde(rename = "type")]
    pub kind: LambdaKind,
    pub concurrency: usize,
    pub wake_up_instances: usize,
    #[serde(default)]
    pub instances: Vec<LambdaInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfrastructure {
    pub partition_index: usize,
    pub lambdas: Vec<LambdaInfrastructure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    pub database_id: String,
    pub configuration: DatabaseConfiguration,
    pub scaling_target_configuration: ScalingTargetConfiguration,
    pub partitions: Vec<PartitionInfrastructure>,
    /// Changes appended since the last flush.
    #[serde(default)]
    pub stored_changes: u64,
    /// Wall-clock time a flush was claimed, if one is running.
    #[serde(default)]
    pub flushing: Option<Timestamp>,
    /// The change log holds every change at or after this timestamp.
    #[serde(default)]
    pub last_flush: Timestamp,
}

pub fn primary_lambda_name(database: &str, partition: usize) -> String {
    format!("{database}-p{partition}-primary")
}

pub fn secondary_lambda_name(database: &str, partition: usize, ordinal: usize) -> String {
    if ordinal == 0 {
        format!("{database}-p{partition}-secondary")
    } else {
        format!("{database}-p{partition}-secondary-{ordinal}")
    }
}

pub fn fallback_lambda_name(database: &str, partition: usize, region: &str) -> String {
    format!("{database}-p{partition}-{region}-fallback")
}

impl Infrastructure {
    /// Lay out the lambdas of a new database.
    pub fn new(
        configuration: DatabaseConfiguration,
        scaling: ScalingTargetConfiguration,
        deployment: &DeploymentConfig,
    ) -> Self {
        let database = configuration.name.clone();
        let home = configuration.region.clone();
        let concurrency = deployment.lambda_concurrency;
        let secondaries = deployment.secondary_lambdas;
        let fallback_regions: Vec<&String> = deployment
            .fallback_regions
            .iter()
            .filter(|r| **r != home)
            .collect();
        let regions = fallback_regions.len();

        let partitions = (0..configuration.partitions.max(1))
            .map(|p| {
                let mut lambdas = vec![LambdaInfrastructure {
                    name: primary_lambda_name(&database, p),
                    region: home.clone(),
                    kind: LambdaKind::Primary,
                    concurrency,
                    wake_up_instances: scaling.warm_primary_instances,
                    instances: Vec::new(),
                }];
                for ordinal in 0..secondaries {
                    lambdas.push(LambdaInfrastructure {
                        name: secondary_lambda_name(&database, p, ordinal),
                        region: home.clone(),
                        kind: LambdaKind::Secondary,
                        concurrency,
                        wake_up_instances: share(scaling.warm_secondary_instances, secondaries, ordinal),
                        instances: Vec::new(),
                    });
                }
                for (ordinal, region) in fallback_regions.iter().enumerate() {
                    lambdas.push(LambdaInfrastructure {
                        name: fallback_lambda_name(&database, p, region),
                        region: (*region).clone(),
                        kind: LambdaKind::Fallback,
                        concurrency,
                        wake_up_instances: share(scaling.warm_regional_instances, regions, ordinal),
                        instances: Vec::new(),
                    });
                }
                PartitionInfrastructure {
                    partition_index: p,
                    lambdas,
                }
            })
            .collect();

        Self {
            database_id: uuid::Uuid::new_v4().to_string(),
            configuration,
            scaling_target_configuration: scaling,
            partitions,
            stored_changes: 0,
            flushing: None,
            last_flush: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    pub fn partition(&self, index: usize) -> Option<&PartitionInfrastructure> {
        self.partitions.iter().find(|p| p.partition_index == index)
    }

    /// Lowest watermark among the known instances of a partition.
    pub fn min_watermark(&self, partition: usize) -> Option<Timestamp> {
        self.partition(partition)?
            .lambdas
            .iter()
            .flat_map(|l| l.instances.iter())
            .map(|i| i.last_updated)
            .min()
    }

    /// Upsert one instance's report, max-merging its watermark, and trim
    /// instances unseen for longer than [`INSTANCE_TTL_MS`].
    pub fn process_state(&mut self, lambda: &str, state: &WorkerState, now: Timestamp) {
        let database = &self.configuration.name;
        let Some(target) = self
            .partitions
            .iter_mut()
            .filter(|p| p.partition_index == state.partition_index)
            .flat_map(|p| p.lambdas.iter_mut())
            .find(|l| l.name == lambda)
        else {
            warn!(
                database = %database,
                lambda,
                partition = state.partition_index,
                "state reported for unknown lambda"
            );
            return;
        };

        match target.instances.iter_mut().find(|i| i.id == state.instance_id) {
            Some(instance) => {
                instance.last_updated = instance.last_updated.max(state.last_update);
                instance.last_seen = instance.last_seen.max(now);
            }
            None => target.instances.push(LambdaInstance {
                id: state.instance_id.clone(),
                last_updated: state.last_update,
                last_seen: now,
            }),
        }
        target
            .instances
            .retain(|i| i.last_seen.saturating_add(INSTANCE_TTL_MS) >= now);
    }

    /// Take the flush claim. Returns false when another flush holds it.
    pub fn try_claim_flush(&mut self, now: Timestamp) -> bool {
        match self.flushing {
            Some(claimed) if claimed.saturating_add(FLUSH_CLAIM_TTL_MS) > now => false,
            _ => {
                self.flushing = Some(now);
                true
            }
        }
    }
}

/// Split `total` warm instances over `n` lambdas, earlier lambdas first.
fn share(total: usize, n: usize, ordinal: usize) -> usize {
    if n == 0 {
        return 0;
    }
    total / n + usize::from(ordinal < total % n)
}

/// Closure applied by a conditional update. It may run more than once.
pub type InfrastructureUpdate<'a> = &'a (dyn Fn(&mut Infrastructure) -> Result<()> + Send + Sync);

#[async_trait]
pub trait InfrastructureStorage: Send + Sync {
    async fn get(&self, database: &str) -> Result<Option<Infrastructure>>;

    /// Unconditional overwrite.
    async fn set(&self, infrastructure: &Infrastructure) -> Result<()>;

    async fn remove(&self, database: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<String>>;

    /// Read-modify-write that never clobbers a concurrent writer. Returns
    /// the record as written.
    async fn update(&self, database: &str, apply: InfrastructureUpdate<'_>) -> Result<Infrastructure>;

    /// Create the record; fails with `DatabaseAlreadyExists` if present.
    async fn deploy(&self, infrastructure: &Infrastructure) -> Result<()>;

    async fn exists(&self, database: &str) -> Result<bool> {
        Ok(self.get(database).await?.is_some())
    }

    async fn destroy(&self, database: &str) -> Result<()> {
        if !self.exists(database).await? {
            return Err(CirrusError::DatabaseNotFound {
                database: database.to_string(),
            });
        }
        self.remove(database).await
    }

    async fn process_state(&self, database: &str, lambda: &str, state: &WorkerState) -> Result<()> {
        let now = crate::types::now_millis();
        self.update(database, &|infra| {
            infra.process_state(lambda, state, now);
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn add_stored_changes(&self, database: &str, count: u64) -> Result<u64> {
        let infra = self
            .update(database, &|infra| {
                infra.stored_changes = infra.stored_changes.saturating_add(count);
                Ok(())
            })
            .await?;
        Ok(infra.stored_changes)
    }

    async fn get_stored_changes(&self, database: &str) -> Result<u64> {
        match self.get(database).await? {
            Some(infra) => Ok(infra.stored_changes),
            None => Err(CirrusError::DatabaseNotFound {
                database: database.to_string(),
            }),
        }
    }

    async fn set_stored_changes(&self, database: &str, count: u64) -> Result<()> {
        self.update(database, &|infra| {
            infra.stored_changes = count;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(partitions: usize) -> DatabaseConfiguration {
        DatabaseConfiguration {
            name: "db".into(),
            region: "us-east-1".into(),
            dimensions: 3,
            space: Default::default(),
            partitions,
            secret_tokens: Vec::new(),
            statistics: None,
        }
    }

    fn deployment() -> DeploymentConfig {
        DeploymentConfig {
            region: "us-east-1".into(),
            fallback_regions: vec!["eu-west-1".into(), "us-east-1".into()],
            secondary_lambdas: 1,
            lambda_concurrency: 8,
        }
    }

    fn state(id: &str, partition: usize, last_update: Timestamp) -> WorkerState {
        WorkerState {
            instance_id: id.into(),
            partition_index: partition,
            last_update,
            last_snapshot: None,
            memory_used: 0,
            memory_limit: 0,
            ephemeral_used: 0,
            ephemeral_limit: 0,
        }
    }

    #[test]
    fn test_layout() {
        let infra = Infrastructure::new(
            configuration(2),
            ScalingTargetConfiguration::default(),
            &deployment(),
        );
        assert_eq!(infra.partitions.len(), 2);
        let names: Vec<_> = infra.partitions[1].lambdas.iter().map(|l| l.name.as_str()).collect();
        // Home region is never its own fallback.
        assert_eq!(
            names,
            vec!["db-p1-primary", "db-p1-secondary", "db-p1-eu-west-1-fallback"]
        );
        assert_eq!(infra.partitions[1].lambdas[2].kind, LambdaKind::Fallback);
    }

    #[test]
    fn test_wire_format() {
        let infra = Infrastructure::new(
            configuration(1),
            ScalingTargetConfiguration::default(),
            &deployment(),
        );
        let json = serde_json::to_value(&infra).unwrap();
        assert_eq!(json["partitions"][0]["lambdas"][0]["type"], "primary");
        assert_eq!(json["scalingTargetConfiguration"]["warmPrimaryInstances"], 1);
        assert_eq!(json["lastFlush"], 0);
    }

    #[test]
    fn test_process_state_max_merges_and_trims() {
        let mut infra = Infrastructure::new(
            configuration(1),
            ScalingTargetConfiguration::default(),
            &deployment(),
        );
        let now = 10 * INSTANCE_TTL_MS;
        infra.process_state("db-p0-primary", &state("a", 0, 50), now - INSTANCE_TTL_MS - 1);
        infra.process_state("db-p0-primary", &state("b", 0, 70), now);
        infra.process_state("db-p0-primary", &state("b", 0, 60), now);
        let instances = &infra.partitions[0].lambdas[0].instances;
        // "a" is older than the TTL and trimmed when "b" reports.
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "b");
        assert_eq!(instances[0].last_updated, 70);
        assert_eq!(infra.min_watermark(0), Some(70));

        // Unknown lambdas are ignored.
        infra.process_state("nope", &state("c", 0, 1), now);
        assert_eq!(infra.min_watermark(0), Some(70));
    }

    #[test]
    fn test_flush_claim() {
        let mut infra = Infrastructure::new(
            configuration(1),
            ScalingTargetConfiguration::default(),
            &deployment(),
        );
        assert!(infra.try_claim_flush(1_000));
        assert!(!infra.try_claim_flush(2_000));
        // Abandoned claims can be taken over.
        assert!(infra.try_claim_flush(1_000 + FLUSH_CLAIM_TTL_MS));
    }

    #[test]
    fn test_share() {
        assert_eq!(share(5, 2, 0), 3);
        assert_eq!(share(5, 2, 1), 2);
        assert_eq!(share(3, 0, 0), 0);
    }
}
