//! Compute worker: owns one partition's index in memory and keeps it fresh
//! from snapshots and the change log.

pub mod rpc;
pub mod state;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::changes::ChangesStorage;
use crate::error::{CirrusError, Result};
use crate::index::{FlatIndex, Index};
use crate::snapshot::{Snapshot, SnapshotStorage};
use crate::types::{
    partition_of, DatabaseConfiguration, IndexCount, KnnQuery, SearchResult, StoredVectorChange,
    Timestamp,
};

pub use rpc::{WorkerReply, WorkerRequest, WorkerResponse};
pub use state::{WorkerLimits, WorkerState};

/// Rough per-entry overhead on top of the raw vector data.
const ENTRY_OVERHEAD_BYTES: u64 = 64;

/// Snapshot reloads a flush tolerates before giving up on a moving log.
const MAX_CATCH_UP_ATTEMPTS: u32 = 3;

/// Result of `save_snapshot_with_updates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutcome {
    /// Changes read from the log and folded into the snapshot.
    pub count: usize,
    pub snapshot: Snapshot,
}

pub struct ComputeWorker {
    instance_id: String,
    database: String,
    partition_index: usize,
    partitions: usize,
    index: Box<dyn Index>,
    changes: Arc<dyn ChangesStorage>,
    snapshots: Arc<dyn SnapshotStorage>,
    last_update: Timestamp,
    last_snapshot: Option<Timestamp>,
    limits: WorkerLimits,
    /// Size of the most recent snapshot file staged in scratch space.
    ephemeral_used: u64,
}

impl ComputeWorker {
    pub fn new(
        configuration: &DatabaseConfiguration,
        partition_index: usize,
        changes: Arc<dyn ChangesStorage>,
        snapshots: Arc<dyn SnapshotStorage>,
        limits: WorkerLimits,
    ) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        debug!(
            database = %configuration.name,
            partition = partition_index,
            instance = %instance_id,
            "starting compute worker"
        );
        Self {
            instance_id,
            database: configuration.name.clone(),
            partition_index,
            partitions: configuration.partitions.max(1),
            index: Box::new(FlatIndex::new(configuration.dimensions, configuration.space)),
            changes,
            snapshots,
            last_update: 0,
            last_snapshot: None,
            limits,
            ephemeral_used: 0,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn last_update(&self) -> Timestamp {
        self.last_update
    }

    pub fn state(&self) -> WorkerState {
        let vector_bytes = self.index.dimensions() as u64 * std::mem::size_of::<f32>() as u64;
        WorkerState {
            instance_id: self.instance_id.clone(),
            partition_index: self.partition_index,
            last_update: self.last_update,
            last_snapshot: self.last_snapshot,
            memory_used: self.index.count() as u64 * (vector_bytes + ENTRY_OVERHEAD_BYTES),
            memory_limit: self.limits.memory_limit,
            ephemeral_used: self.ephemeral_used,
            ephemeral_limit: self.limits.ephemeral_limit,
        }
    }

    /// Apply changes at or above the watermark that belong to this
    /// partition. Returns how many were applied.
    #[instrument(skip(self, changes), fields(database = %self.database, partition = self.partition_index, count = changes.len()))]
    pub fn update(&mut self, changes: &[StoredVectorChange]) -> Result<usize> {
        let dimensions = self.index.dimensions();
        let mut newest = self.last_update;
        let mut pending = Vec::new();
        for change in changes {
            if change.timestamp() < self.last_update {
                continue;
            }
            newest = newest.max(change.timestamp());
            if partition_of(change.label(), self.partitions) != self.partition_index {
                continue;
            }
            if let StoredVectorChange::Add { vector, .. } = change {
                if vector.vector.len() != dimensions {
                    return Err(CirrusError::DimensionMismatch {
                        expected: dimensions,
                        actual: vector.vector.len(),
                    });
                }
            }
            pending.push(change);
        }

        for change in &pending {
            match change {
                StoredVectorChange::Add { vector, .. } => {
                    self.index.remove(&vector.label);
                    self.index.add(vector.clone())?;
                }
                StoredVectorChange::Remove { label, .. } => {
                    self.index.remove(label);
                }
            }
        }

        self.last_update = newest;
        Ok(pending.len())
    }

    fn validate_query(&self, query: &KnnQuery) -> Result<usize> {
        if query.k < 0 {
            return Err(CirrusError::Validation(format!(
                "k must be >= 0, got {}",
                query.k
            )));
        }
        if query.vector.len() != self.index.dimensions() {
            return Err(CirrusError::DimensionMismatch {
                expected: self.index.dimensions(),
                actual: query.vector.len(),
            });
        }
        Ok(query.k as usize)
    }

    /// Reload the latest snapshot when older than the caller's bound, then
    /// apply the inline tail.
    async fn prepare(
        &mut self,
        updates: &[StoredVectorChange],
        min_snapshot_timestamp: Timestamp,
    ) -> Result<()> {
        if self.last_update < min_snapshot_timestamp {
            debug!(
                last_update = self.last_update,
                min_snapshot_timestamp, "worker behind freshness bound, reloading snapshot"
            );
            self.load_latest_snapshot().await?;
        }
        self.update(updates)?;
        Ok(())
    }

    #[instrument(skip(self, query, updates), fields(database = %self.database, partition = self.partition_index))]
    pub async fn query(
        &mut self,
        query: &KnnQuery,
        updates: &[StoredVectorChange],
        min_snapshot_timestamp: Timestamp,
    ) -> Result<Vec<SearchResult>> {
        let k = self.validate_query(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        self.prepare(updates, min_snapshot_timestamp).await?;

        let mut results = self.index.knn(&query.vector, k)?;
        if !query.include_vectors {
            for result in &mut results {
                result.vector = None;
            }
        }
        Ok(results)
    }

    pub async fn count(
        &mut self,
        updates: &[StoredVectorChange],
        min_snapshot_timestamp: Timestamp,
    ) -> Result<IndexCount> {
        self.prepare(updates, min_snapshot_timestamp).await?;
        Ok(IndexCount {
            count: self.index.count(),
            dimensions: self.index.dimensions(),
        })
    }

    /// Serialize the index and upload it as the snapshot at the watermark.
    #[instrument(skip(self), fields(database = %self.database, partition = self.partition_index))]
    pub async fn save_snapshot(&mut self) -> Result<Snapshot> {
        let directory = self.snapshots.directory_path().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        let path = directory.join(format!("{}-{}.upload", self.instance_id, self.last_update));

        self.index.save(&path)?;
        self.ephemeral_used = tokio::fs::metadata(&path).await?.len();
        let uploaded = self.snapshots.create(&path, self.last_update).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove scratch snapshot");
        }
        let snapshot = uploaded?;

        self.last_snapshot = Some(snapshot.timestamp);
        crate::metrics::SNAPSHOTS_SAVED_TOTAL
            .with_label_values(&[&self.database])
            .inc();
        info!(
            timestamp = snapshot.timestamp,
            vectors = self.index.count(),
            "saved snapshot"
        );
        Ok(snapshot)
    }

    /// Fold every change newer than the last snapshot into the index,
    /// snapshot it, and trim superseded snapshots except the previous one.
    #[instrument(skip(self), fields(database = %self.database, partition = self.partition_index))]
    pub async fn save_snapshot_with_updates(
        &mut self,
        min_snapshot_timestamp: Timestamp,
    ) -> Result<SnapshotOutcome> {
        if self.last_update < min_snapshot_timestamp {
            self.load_latest_snapshot().await?;
        }

        let mut attempts = 0;
        let changes = loop {
            let after = self.last_snapshot.map_or(0, |ts| ts + 1);
            let changes = self.changes.get_all_changes_after(after).await?;
            // A flush trims the log only after snapshotting past the trim
            // point, so a snapshot newer than our watermark means the read
            // may be missing changes.
            match self.snapshots.latest_timestamp().await? {
                Some(latest) if latest > self.last_update => {
                    attempts += 1;
                    if attempts > MAX_CATCH_UP_ATTEMPTS {
                        return Err(CirrusError::Conflict {
                            key: format!("{}/snapshots/p{}", self.database, self.partition_index),
                        });
                    }
                    debug!(
                        latest,
                        last_update = self.last_update,
                        "newer snapshot published, reloading before flush"
                    );
                    self.load_latest_snapshot().await?;
                }
                _ => break changes,
            }
        };
        let previous = self.last_snapshot;
        self.update(&changes)?;
        let snapshot = self.save_snapshot().await?;

        if let Some(previous) = previous {
            let removed = self.snapshots.clear_before(previous).await?;
            debug!(removed, "trimmed superseded snapshots");
        }
        Ok(SnapshotOutcome {
            count: changes.len(),
            snapshot,
        })
    }

    /// Replace the index with the newest snapshot. A no-op when none exists.
    #[instrument(skip(self), fields(database = %self.database, partition = self.partition_index))]
    pub async fn load_latest_snapshot(&mut self) -> Result<Option<Snapshot>> {
        let Some(snapshot) = self.snapshots.load_latest().await? else {
            debug!("no snapshot to load");
            return Ok(None);
        };
        self.ephemeral_used = tokio::fs::metadata(&snapshot.file_path).await?.len();
        let loaded = self.index.load(&snapshot.file_path);
        if let Err(e) = tokio::fs::remove_file(&snapshot.file_path).await {
            warn!(path = %snapshot.file_path.display(), error = %e, "failed to remove downloaded snapshot");
        }
        loaded?;

        self.last_update = snapshot.timestamp;
        self.last_snapshot = Some(snapshot.timestamp);
        info!(
            timestamp = snapshot.timestamp,
            vectors = self.index.count(),
            "loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Keep this instance busy, and therefore warm, for `duration_ms`.
    pub async fn wake(&self, duration_ms: u64) {
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
    }

    /// Dispatch one RPC request and encode the reply envelope.
    pub async fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        let method = request.method();
        let response = match request {
            WorkerRequest::State => self.reply(Ok(())),
            WorkerRequest::Query(args) => {
                let result = self
                    .query(&args.query, &args.updates, args.min_snapshot_timestamp)
                    .await;
                self.reply(result)
            }
            WorkerRequest::Update(args) => {
                let result = self.update(&args.changes);
                self.reply(result)
            }
            WorkerRequest::SaveSnapshot => {
                let result = self.save_snapshot().await;
                self.reply(result)
            }
            WorkerRequest::SaveSnapshotWithUpdates(args) => {
                let result = self
                    .save_snapshot_with_updates(args.min_snapshot_timestamp)
                    .await;
                self.reply(result)
            }
            WorkerRequest::LoadLatestSnapshot => {
                let result = self.load_latest_snapshot().await;
                self.reply(result)
            }
            WorkerRequest::Count(args) => {
                let result = self
                    .count(&args.updates, args.min_snapshot_timestamp)
                    .await;
                self.reply(result)
            }
            WorkerRequest::Wake(args) => {
                self.wake(args.duration_ms).await;
                self.reply(Ok(()))
            }
        };
        if !response.is_success() {
            debug!(method, status = response.status_code, "worker request failed");
        }
        response
    }

    fn reply<T: Serialize>(&self, result: Result<T>) -> WorkerResponse {
        let encoded = result.and_then(|value| WorkerResponse::ok(&value, &self.state()));
        match encoded {
            Ok(response) => response,
            Err(e) => WorkerResponse::from_error(&e),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::MemoryChangesStorage;
    use crate::snapshot::ObjectSnapshotStorage;
    use crate::storage::CirrusStore;
    use crate::types::{DistanceSpace, VectorEntry};

    struct Fixture {
        _dir: tempfile::TempDir,
        changes: Arc<MemoryChangesStorage>,
        snapshots: Arc<ObjectSnapshotStorage>,
        config: DatabaseConfiguration,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let snapshots = Arc::new(ObjectSnapshotStorage::new(
                CirrusStore::in_memory(),
                "db",
                0,
                dir.path(),
            ));
            Self {
                _dir: dir,
                changes: Arc::new(MemoryChangesStorage::new()),
                snapshots,
                config: DatabaseConfiguration {
                    name: "db".into(),
                    region: "us-east-1".into(),
                    dimensions: 3,
                    space: DistanceSpace::L2,
                    partitions: 1,
                    secret_tokens: Vec::new(),
                    statistics: None,
                },
            }
        }

        fn worker(&self) -> ComputeWorker {
            ComputeWorker::new(
                &self.config,
                0,
                self.changes.clone(),
                self.snapshots.clone(),
                WorkerLimits::default(),
            )
        }
    }

    fn add(ts: Timestamp, label: &str, vector: Vec<f32>) -> StoredVectorChange {
        StoredVectorChange::Add {
            timestamp: ts,
            vector: VectorEntry {
                label: label.into(),
                vector,
                metadata: None,
            },
        }
    }

    fn remove(ts: Timestamp, label: &str) -> StoredVectorChange {
        StoredVectorChange::Remove {
            timestamp: ts,
            label: label.into(),
        }
    }

    fn knn(vector: Vec<f32>, k: i64) -> KnnQuery {
        KnnQuery {
            vector,
            k,
            include_vectors: false,
        }
    }

    #[tokio::test]
    async fn test_update_skips_changes_below_watermark() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        assert_eq!(worker.update(&[add(10, "a", vec![1.0, 0.0, 0.0])]).unwrap(), 1);
        assert_eq!(worker.last_update(), 10);

        // Older change is ignored, equal timestamp is re-applied.
        assert_eq!(worker.update(&[remove(5, "a")]).unwrap(), 0);
        assert_eq!(worker.update(&[add(10, "a", vec![1.0, 0.0, 0.0])]).unwrap(), 1);
        let count = worker.count(&[], 0).await.unwrap();
        assert_eq!(count.count, 1);
        assert_eq!(worker.last_update(), 10);
    }

    #[tokio::test]
    async fn test_add_overwrites_existing_label() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        worker
            .update(&[add(1, "a", vec![0.0, 0.0, 0.0]), add(2, "a", vec![9.0, 9.0, 9.0])])
            .unwrap();
        let hits = worker
            .query(
                &KnnQuery {
                    vector: vec![9.0, 9.0, 9.0],
                    k: 5,
                    include_vectors: true,
                },
                &[],
                0,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vector.as_deref(), Some(&[9.0, 9.0, 9.0][..]));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_in_update_leaves_state_untouched() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        let err = worker
            .update(&[add(1, "a", vec![1.0, 0.0, 0.0]), add(2, "b", vec![1.0])])
            .unwrap_err();
        assert!(matches!(err, CirrusError::DimensionMismatch { .. }));
        assert_eq!(worker.last_update(), 0);
        assert_eq!(worker.count(&[], 0).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_query_validation() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        let updates = [add(1, "a", vec![1.0, 0.0, 0.0])];

        let err = worker.query(&knn(vec![1.0, 0.0, 0.0], -1), &updates, 0).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = worker.query(&knn(vec![1.0, 0.0], 1), &updates, 0).await.unwrap_err();
        assert!(matches!(err, CirrusError::DimensionMismatch { expected: 3, actual: 2 }));
        // Rejected requests never touch the index.
        assert_eq!(worker.last_update(), 0);

        let hits = worker.query(&knn(vec![1.0, 0.0, 0.0], 0), &updates, 0).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(worker.last_update(), 0);

        let hits = worker.query(&knn(vec![1.0, 0.0, 0.0], 3), &updates, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].vector.is_none());
    }

    #[tokio::test]
    async fn test_ignores_other_partitions() {
        let mut fx = Fixture::new();
        fx.config.partitions = 4;
        let mut worker = fx.worker();
        let labels: Vec<String> = (0..32).map(|i| format!("v{i}")).collect();
        let changes: Vec<_> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| add(i as u64 + 1, l, vec![i as f32, 0.0, 0.0]))
            .collect();
        let applied = worker.update(&changes).unwrap();
        let own = labels.iter().filter(|l| partition_of(l, 4) == 0).count();
        assert_eq!(applied, own);
        assert_eq!(worker.last_update(), 32);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_between_instances() {
        let fx = Fixture::new();
        fx.changes
            .add(vec![
                add(1, "a", vec![1.0, 0.0, 0.0]),
                add(2, "b", vec![0.0, 1.0, 0.0]),
                remove(3, "a"),
            ])
            .await
            .unwrap();

        let mut first = fx.worker();
        let outcome = first.save_snapshot_with_updates(0).await.unwrap();
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.snapshot.timestamp, 3);
        assert_eq!(first.state().last_snapshot, Some(3));

        let mut second = fx.worker();
        assert_ne!(first.instance_id(), second.instance_id());
        let loaded = second.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp, 3);
        assert_eq!(second.last_update(), 3);

        let hits = second.query(&knn(vec![0.0, 1.0, 0.0], 10), &[], 0).await.unwrap();
        let labels: Vec<_> = hits.iter().map(|h| h.label.as_str()).collect();
        assert_eq!(labels, vec!["b"]);
    }

    #[tokio::test]
    async fn test_load_latest_snapshot_without_snapshot_is_noop() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        worker.update(&[add(4, "a", vec![1.0, 1.0, 1.0])]).unwrap();
        assert!(worker.load_latest_snapshot().await.unwrap().is_none());
        assert_eq!(worker.last_update(), 4);
        assert_eq!(worker.count(&[], 0).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_stale_worker_reloads_snapshot_before_query() {
        let fx = Fixture::new();
        fx.changes
            .add(vec![add(5, "a", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let mut flusher = fx.worker();
        flusher.save_snapshot_with_updates(0).await.unwrap();
        fx.changes.clear_before(5).await.unwrap();

        let mut cold = fx.worker();
        let tail = [add(6, "b", vec![0.0, 1.0, 0.0])];
        let hits = cold.query(&knn(vec![1.0, 0.0, 0.0], 10), &tail, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].label, "a");
        assert_eq!(cold.last_update(), 6);
    }

    #[tokio::test]
    async fn test_save_snapshot_with_updates_keeps_previous_snapshot() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        for ts in [1u64, 2, 3] {
            fx.changes
                .add(vec![add(ts, &format!("v{ts}"), vec![ts as f32, 0.0, 0.0])])
                .await
                .unwrap();
            worker.save_snapshot_with_updates(0).await.unwrap();
        }
        // Snapshots at 1, 2, 3: the one before the previous is trimmed.
        let latest = fx.snapshots.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 3);
        assert_eq!(fx.snapshots.clear_before(u64::MAX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_late_flush_after_trim_keeps_every_change() {
        let fx = Fixture::new();
        let changes: Vec<_> = (1..=10u64)
            .map(|ts| add(ts, &format!("v{ts}"), vec![ts as f32, 0.0, 0.0]))
            .collect();
        fx.changes.add(changes.clone()).await.unwrap();

        let mut slow = fx.worker();
        slow.update(&changes[..4]).unwrap();

        let mut winner = fx.worker();
        let outcome = winner.save_snapshot_with_updates(0).await.unwrap();
        assert_eq!(outcome.snapshot.timestamp, 10);
        fx.changes.clear_before(10).await.unwrap();

        let late = slow.save_snapshot_with_updates(0).await.unwrap();
        assert_eq!(late.snapshot.timestamp, 10);
        assert_eq!(slow.count(&[], 0).await.unwrap().count, 10);

        let mut cold = fx.worker();
        cold.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(cold.last_update(), 10);
        assert_eq!(cold.count(&[], 0).await.unwrap().count, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_snapshot_loads() {
        let fx = Fixture::new();
        let changes: Vec<_> = (1..=200u64)
            .map(|ts| add(ts, &format!("v{ts}"), vec![ts as f32, 1.0, 2.0]))
            .collect();
        fx.changes.add(changes).await.unwrap();
        fx.worker().save_snapshot_with_updates(0).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mut worker = fx.worker();
                tokio::spawn(async move {
                    let snapshot = worker.load_latest_snapshot().await.unwrap().unwrap();
                    (snapshot.timestamp, worker.count(&[], 0).await.unwrap().count)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), (200, 200));
        }
    }

    #[tokio::test]
    async fn test_handle_encodes_envelope() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        let response = worker
            .handle(WorkerRequest::Update(rpc::UpdateArgs {
                changes: vec![add(3, "a", vec![1.0, 2.0, 3.0])],
            }))
            .await;
        let reply: WorkerReply<usize> = response.into_reply().unwrap();
        assert_eq!(reply.result, 1);
        assert_eq!(reply.state.last_update, 3);

        let response = worker
            .handle(WorkerRequest::Query(rpc::QueryArgs {
                query: knn(vec![1.0], 1),
                updates: Vec::new(),
                min_snapshot_timestamp: 0,
            }))
            .await;
        assert_eq!(response.status_code, 400);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["status"], 400);
    }
}
