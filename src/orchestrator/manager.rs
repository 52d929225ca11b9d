use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::merge::merge_results;
use crate::changes::ChangesStorage;
use crate::config::Config;
use crate::error::{CirrusError, Result};
use crate::infrastructure::{Infrastructure, InfrastructureStorage};
use crate::partition::{PartitionWorker, WorkerInvoker, ALL_TIERS};
use crate::types::{
    now_millis, partition_of, DatabaseConfiguration, IndexCount, KnnQuery, Label, SearchResult,
    SecretToken, StoredVectorChange, Timestamp, VectorEntry,
};
use crate::worker::rpc::{CountArgs, FreshnessArgs, QueryArgs, WakeArgs};
use crate::worker::{SnapshotOutcome, WorkerRequest};

/// Request limits and flush policy applied by an [`IndexManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_batch_size: usize,
    pub max_top_k: usize,
    pub max_label_length: usize,
    pub max_changes_count: u64,
    pub wake_duration_ms: u64,
    pub invoke_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_batch_size: config.server.max_batch_size,
            max_top_k: config.server.max_top_k,
            max_label_length: config.server.max_label_length,
            max_changes_count: config.flush.max_changes_count,
            wake_duration_ms: config.flush.wake_duration_ms,
            invoke_timeout: Duration::from_millis(config.partition.invoke_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub timestamp: Timestamp,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    /// Changes removed from the log.
    pub flushed: u64,
    pub last_flush: Timestamp,
}

/// Read and write path of one database.
pub struct IndexManager {
    configuration: Arc<DatabaseConfiguration>,
    partitions: Vec<PartitionWorker>,
    changes: Arc<dyn ChangesStorage>,
    infrastructure: Arc<dyn InfrastructureStorage>,
    settings: ManagerSettings,
    last_timestamp: AtomicU64,
    /// Appends hold it shared; a flush holds it exclusively while workers
    /// read the log, so no change can land behind a snapshot.
    append_gate: RwLock<()>,
}

impl IndexManager {
    pub fn new(
        configuration: DatabaseConfiguration,
        changes: Arc<dyn ChangesStorage>,
        infrastructure: Arc<dyn InfrastructureStorage>,
        invoker: Arc<dyn WorkerInvoker>,
        settings: ManagerSettings,
    ) -> Self {
        let configuration = Arc::new(configuration);
        let partitions = (0..configuration.partitions.max(1))
            .map(|p| {
                PartitionWorker::new(
                    configuration.clone(),
                    p,
                    invoker.clone(),
                    infrastructure.clone(),
                    settings.invoke_timeout,
                )
            })
            .collect();
        Self {
            configuration,
            partitions,
            changes,
            infrastructure,
            settings,
            last_timestamp: AtomicU64::new(0),
            append_gate: RwLock::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    pub fn dimensions(&self) -> usize {
        self.configuration.dimensions
    }

    pub async fn infrastructure(&self) -> Result<Infrastructure> {
        self.infrastructure
            .get(self.name())
            .await?
            .ok_or_else(|| CirrusError::DatabaseNotFound {
                database: self.name().to_string(),
            })
    }

    /// Strictly increasing millisecond timestamp for a new change batch.
    fn next_timestamp(&self) -> Timestamp {
        let mut last = self.last_timestamp.load(Ordering::Acquire);
        loop {
            let candidate = now_millis().max(last + 1);
            match self.last_timestamp.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(current) => last = current,
            }
        }
    }

    /// Change-log tail each partition needs, starting at its lowest known
    /// instance watermark clamped to the last flush.
    async fn tails(&self, infra: &Infrastructure) -> Result<Vec<Vec<StoredVectorChange>>> {
        let starts: Vec<Timestamp> = (0..self.partitions.len())
            .map(|p| infra.min_watermark(p).unwrap_or(0).min(infra.last_flush))
            .collect();
        let from = starts.iter().copied().min().unwrap_or(0);
        let log = self.changes.get_all_changes_after(from).await?;

        let partitions = self.partitions.len();
        let mut tails = vec![Vec::new(); partitions];
        for change in log {
            let p = partition_of(change.label(), partitions);
            if change.timestamp() >= starts[p] {
                tails[p].push(change);
            }
        }
        debug!(
            from,
            sizes = ?tails.iter().map(Vec::len).collect::<Vec<_>>(),
            "prepared change-log tails"
        );
        Ok(tails)
    }

    fn validate_query(&self, query: &KnnQuery) -> Result<()> {
        if query.k < 0 {
            return Err(CirrusError::Validation(format!(
                "k must be >= 0, got {}",
                query.k
            )));
        }
        if query.k as u64 > self.settings.max_top_k as u64 {
            return Err(CirrusError::Validation(format!(
                "k must be <= {}, got {}",
                self.settings.max_top_k, query.k
            )));
        }
        if query.vector.len() != self.dimensions() {
            return Err(CirrusError::DimensionMismatch {
                expected: self.dimensions(),
                actual: query.vector.len(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, query), fields(database = %self.configuration.name, k = query.k))]
    pub async fn query(&self, query: KnnQuery) -> Result<Vec<SearchResult>> {
        self.validate_query(&query)?;
        if query.k == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        crate::metrics::QUERIES_TOTAL
            .with_label_values(&[self.name()])
            .inc();
        crate::metrics::ACTIVE_QUERIES.inc();
        let _active = crate::metrics::GaugeGuard(&crate::metrics::ACTIVE_QUERIES);

        let infra = self.infrastructure().await?;
        let tails = self.tails(&infra).await?;

        let requests = self.partitions.iter().zip(tails).map(|(worker, updates)| {
            let infra = &infra;
            let query = query.clone();
            async move {
                let partition = partition_infrastructure(infra, worker.partition())?;
                let request = WorkerRequest::Query(QueryArgs {
                    query,
                    updates,
                    min_snapshot_timestamp: infra.last_flush,
                });
                worker
                    .request(partition, request)
                    .await?
                    .decode::<Vec<SearchResult>>()
                    .map(|reply| reply.result)
            }
        });
        let lists = futures::future::try_join_all(requests).await?;
        let merged = merge_results(lists);

        crate::metrics::QUERY_DURATION
            .with_label_values(&[self.name()])
            .observe(start.elapsed().as_secs_f64());
        debug!(results = merged.len(), elapsed_ms = start.elapsed().as_millis(), "query complete");
        Ok(merged)
    }

    /// Vector count across partitions, prepared like a query.
    #[instrument(skip(self), fields(database = %self.configuration.name))]
    pub async fn count(&self) -> Result<IndexCount> {
        let infra = self.infrastructure().await?;
        let tails = self.tails(&infra).await?;

        let requests = self.partitions.iter().zip(tails).map(|(worker, updates)| {
            let infra = &infra;
            async move {
                let partition = partition_infrastructure(infra, worker.partition())?;
                let request = WorkerRequest::Count(CountArgs {
                    updates,
                    min_snapshot_timestamp: infra.last_flush,
                });
                worker
                    .request(partition, request)
                    .await?
                    .decode::<IndexCount>()
                    .map(|reply| reply.result)
            }
        });
        let counts = futures::future::try_join_all(requests).await?;
        Ok(IndexCount {
            count: counts.iter().map(|c| c.count).sum(),
            dimensions: self.dimensions(),
        })
    }

    fn validate_batch(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(CirrusError::Validation("batch must not be empty".into()));
        }
        if len > self.settings.max_batch_size {
            return Err(CirrusError::Validation(format!(
                "batch size {len} exceeds maximum {}",
                self.settings.max_batch_size
            )));
        }
        Ok(())
    }

    fn validate_label(&self, label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(CirrusError::Validation("label must not be empty".into()));
        }
        if label.len() > self.settings.max_label_length {
            return Err(CirrusError::Validation(format!(
                "label length {} exceeds maximum {}",
                label.len(),
                self.settings.max_label_length
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, vectors), fields(database = %self.configuration.name, count = vectors.len()))]
    pub async fn add(&self, vectors: Vec<VectorEntry>) -> Result<WriteOutcome> {
        self.validate_batch(vectors.len())?;
        for vector in &vectors {
            self.validate_label(&vector.label)?;
            if vector.vector.len() != self.dimensions() {
                return Err(CirrusError::DimensionMismatch {
                    expected: self.dimensions(),
                    actual: vector.vector.len(),
                });
            }
            if vector.vector.iter().any(|x| !x.is_finite()) {
                return Err(CirrusError::Validation(format!(
                    "vector {} contains non-finite values",
                    vector.label
                )));
            }
        }
        self.append(|timestamp| {
            vectors
                .into_iter()
                .map(|vector| StoredVectorChange::Add { timestamp, vector })
                .collect()
        })
        .await
    }

    #[instrument(skip(self, labels), fields(database = %self.configuration.name, count = labels.len()))]
    pub async fn remove(&self, labels: Vec<Label>) -> Result<WriteOutcome> {
        self.validate_batch(labels.len())?;
        for label in &labels {
            self.validate_label(label)?;
        }
        self.append(|timestamp| {
            labels
                .into_iter()
                .map(|label| StoredVectorChange::Remove { timestamp, label })
                .collect()
        })
        .await
    }

    async fn append(
        &self,
        build: impl FnOnce(Timestamp) -> Vec<StoredVectorChange>,
    ) -> Result<WriteOutcome> {
        let (timestamp, count) = {
            let _gate = self.append_gate.read().await;
            let timestamp = self.next_timestamp();
            let changes = build(timestamp);
            let count = changes.len();
            let outcome = self.changes.add(changes).await?;
            if !outcome.is_complete() {
                return Err(CirrusError::Conflict {
                    key: format!(
                        "{}/changes ({} unprocessed)",
                        self.name(),
                        outcome.unprocessed_items.len()
                    ),
                });
            }
            (timestamp, count)
        };
        crate::metrics::CHANGES_APPENDED_TOTAL
            .with_label_values(&[self.name()])
            .inc_by(count as u64);

        let stored = self
            .infrastructure
            .add_stored_changes(self.name(), count as u64)
            .await?;
        debug!(timestamp, count, stored, "appended changes");

        if stored >= self.settings.max_changes_count {
            match self.flush().await {
                Ok(outcome) => debug!(flushed = outcome.flushed, "threshold flush complete"),
                Err(CirrusError::FlushInProgress { .. }) => {}
                Err(e) => warn!(error = %e, "threshold flush failed"),
            }
        }
        Ok(WriteOutcome { timestamp, count })
    }

    /// Snapshot every partition, trim the log, then prime warm instances.
    #[instrument(skip(self), fields(database = %self.configuration.name))]
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let start = Instant::now();
        let now = now_millis();
        let database = self.name().to_string();
        let claimed = self
            .infrastructure
            .update(self.name(), &|infra| {
                if infra.try_claim_flush(now) {
                    Ok(())
                } else {
                    Err(CirrusError::FlushInProgress {
                        database: database.clone(),
                    })
                }
            })
            .await?;
        let observed = claimed.stored_changes;
        info!(observed, last_flush = claimed.last_flush, "flush started");

        let snapshotted = self.snapshot_partitions(&claimed).await;
        let released = match &snapshotted {
            Ok((watermark, _)) => {
                let watermark = *watermark;
                self.infrastructure
                    .update(self.name(), &|infra| {
                        infra.flushing = None;
                        infra.last_flush = infra.last_flush.max(watermark);
                        infra.stored_changes = infra.stored_changes.saturating_sub(observed);
                        Ok(())
                    })
                    .await
            }
            Err(_) => {
                self.infrastructure
                    .update(self.name(), &|infra| {
                        infra.flushing = None;
                        Ok(())
                    })
                    .await
            }
        };

        let (watermark, flushed) = match snapshotted {
            Ok(done) => done,
            Err(e) => {
                crate::metrics::FLUSHES_TOTAL
                    .with_label_values(&[self.name(), "failure"])
                    .inc();
                if let Err(release_err) = released {
                    warn!(error = %release_err, "failed to release flush claim");
                }
                return Err(e);
            }
        };
        let infra = released?;

        crate::metrics::FLUSHES_TOTAL
            .with_label_values(&[self.name(), "success"])
            .inc();
        crate::metrics::FLUSH_DURATION
            .with_label_values(&[self.name()])
            .observe(start.elapsed().as_secs_f64());
        info!(flushed, last_flush = watermark, "flush completed");

        let primed = self
            .request_all(&infra, WorkerRequest::LoadLatestSnapshot)
            .await;
        debug!(primed, "primed warm instances");

        Ok(FlushOutcome {
            flushed,
            last_flush: watermark,
        })
    }

    /// Save a snapshot on every partition and trim the change log up to the
    /// oldest one. Returns the new flush watermark and the trimmed count.
    async fn snapshot_partitions(&self, infra: &Infrastructure) -> Result<(Timestamp, u64)> {
        let _gate = self.append_gate.write().await;
        let requests = self.partitions.iter().map(|worker| async move {
            let partition = partition_infrastructure(infra, worker.partition())?;
            let request = WorkerRequest::SaveSnapshotWithUpdates(FreshnessArgs {
                min_snapshot_timestamp: infra.last_flush,
            });
            worker
                .request(partition, request)
                .await?
                .decode::<SnapshotOutcome>()
                .map(|reply| reply.result)
        });
        let outcomes = futures::future::try_join_all(requests).await?;
        let watermark = outcomes
            .iter()
            .map(|o| o.snapshot.timestamp)
            .min()
            .unwrap_or(infra.last_flush);
        let flushed = self.changes.clear_before(watermark).await?;
        Ok((watermark, flushed))
    }

    /// Fan a request out to every partition's warm-instance target.
    /// Returns the number of successful replies.
    async fn request_all(&self, infra: &Infrastructure, request: WorkerRequest) -> usize {
        let scaling = &infra.scaling_target_configuration;
        let fanouts = self.partitions.iter().filter_map(|worker| {
            let partition = infra.partition(worker.partition())?;
            Some(worker.request_all(partition, request.clone(), ALL_TIERS, scaling))
        });
        let mut ok = 0;
        for replies in futures::future::join_all(fanouts).await {
            for reply in replies {
                match reply {
                    Ok(_) => ok += 1,
                    Err(CirrusError::WorkerBusy { .. }) => {}
                    Err(e) => warn!(error = %e, "warm-instance request failed"),
                }
            }
        }
        ok
    }

    /// Keep the configured number of instances warm in every tier.
    #[instrument(skip(self), fields(database = %self.configuration.name))]
    pub async fn wake_up_workers(&self) -> Result<usize> {
        let infra = self.infrastructure().await?;
        let request = WorkerRequest::Wake(WakeArgs {
            duration_ms: self.settings.wake_duration_ms,
        });
        let woken = self.request_all(&infra, request).await;
        debug!(woken, "woke warm instances");
        Ok(woken)
    }

    /// Token-free view of the configuration.
    pub async fn configuration(&self) -> Result<DatabaseConfiguration> {
        Ok(self.infrastructure().await?.configuration.redacted())
    }

    /// Check a caller's token. Databases without tokens are open.
    pub async fn authorize(&self, token: Option<&str>) -> Result<()> {
        let infra = self.infrastructure().await?;
        let tokens = &infra.configuration.secret_tokens;
        if tokens.is_empty() {
            return Ok(());
        }
        match token {
            Some(value) if tokens.iter().any(|t| t.value == value) => Ok(()),
            _ => Err(CirrusError::Unauthorized {
                database: self.name().to_string(),
            }),
        }
    }

    /// Generate a new named token.
    #[instrument(skip(self), fields(database = %self.configuration.name))]
    pub async fn add_token(&self, name: &str) -> Result<SecretToken> {
        if name.is_empty() {
            return Err(CirrusError::Validation("token name must not be empty".into()));
        }
        let token = SecretToken {
            name: name.to_string(),
            value: uuid::Uuid::new_v4().to_string(),
        };
        self.infrastructure
            .update(self.name(), &|infra| {
                let tokens = &mut infra.configuration.secret_tokens;
                if tokens.iter().any(|t| t.name == token.name) {
                    return Err(CirrusError::TokenAlreadyExists {
                        name: token.name.clone(),
                    });
                }
                tokens.push(token.clone());
                Ok(())
            })
            .await?;
        info!(token = name, "added secret token");
        Ok(token)
    }

    #[instrument(skip(self), fields(database = %self.configuration.name))]
    pub async fn remove_token(&self, name: &str) -> Result<()> {
        self.infrastructure
            .update(self.name(), &|infra| {
                let tokens = &mut infra.configuration.secret_tokens;
                let before = tokens.len();
                tokens.retain(|t| t.name != name);
                if tokens.len() == before {
                    return Err(CirrusError::TokenNotFound {
                        name: name.to_string(),
                    });
                }
                Ok(())
            })
            .await?;
        info!(token = name, "removed secret token");
        Ok(())
    }

    /// Current value of the flush counter.
    pub async fn stored_changes(&self) -> Result<u64> {
        self.infrastructure.get_stored_changes(self.name()).await
    }

    pub fn max_changes_count(&self) -> u64 {
        self.settings.max_changes_count
    }

    /// Per-partition lowest instance watermark, for diagnostics.
    pub async fn watermarks(&self) -> Result<HashMap<usize, Option<Timestamp>>> {
        let infra = self.infrastructure().await?;
        Ok((0..self.partitions.len())
            .map(|p| (p, infra.min_watermark(p)))
            .collect())
    }
}

fn partition_infrastructure(
    infra: &Infrastructure,
    partition: usize,
) -> Result<&crate::infrastructure::PartitionInfrastructure> {
    infra
        .partition(partition)
        .ok_or(CirrusError::NoActiveLambda { partition })
}
