use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use cirrus::changes::{ChangesStorage, MemoryChangesStorage};
use cirrus::config::{Config, ScalingTargetConfiguration};
use cirrus::partition::WorkerFactory;
use cirrus::snapshot::ObjectSnapshotStorage;
use cirrus::storage::CirrusStore;
use cirrus::types::{DatabaseConfiguration, DistanceSpace};
use cirrus::worker::{ComputeWorker, WorkerLimits};

/// Test harness over the in-memory object store. Each harness gets its own
/// store, scratch directory and database-name prefix.
pub struct TestHarness {
    pub store: CirrusStore,
    pub prefix: String,
    pub scratch: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        cirrus::metrics::init();
        Self {
            store: CirrusStore::in_memory(),
            prefix: format!("test-{}", &Uuid::new_v4().simple().to_string()[..12]),
            scratch: tempfile::tempdir().expect("failed to create scratch dir"),
        }
    }

    /// Database name scoped to this harness.
    pub fn db(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.prefix)
    }

    /// Server config wired to the in-memory backends and this scratch dir.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.storage.backend = "memory".to_string();
        config.worker.scratch_dir = self.scratch.path().to_path_buf();
        config.deployment.region = "us-east-1".to_string();
        config.deployment.fallback_regions = vec!["eu-west-1".to_string()];
        config.deployment.secondary_lambdas = 1;
        config.deployment.lambda_concurrency = 32;
        config.partition.invoke_timeout_ms = 2_000;
        config.flush.max_changes_count = 1_000;
        config.flush.keep_warm_interval_secs = 9_999;
        config.flush.wake_duration_ms = 20;
        config.scaling = ScalingTargetConfiguration::default();
        config
    }

    pub fn configuration(&self, name: &str, dimensions: usize, partitions: usize) -> DatabaseConfiguration {
        DatabaseConfiguration {
            name: name.to_string(),
            region: "us-east-1".to_string(),
            dimensions,
            space: DistanceSpace::L2,
            partitions,
            secret_tokens: Vec::new(),
            statistics: None,
        }
    }

    /// Worker factory sharing one change log and counting cold starts.
    pub fn factory(&self) -> Arc<CountingFactory> {
        Arc::new(CountingFactory {
            store: self.store.clone(),
            scratch: self.scratch.path().to_path_buf(),
            changes: Arc::new(MemoryChangesStorage::new()),
            created: AtomicUsize::new(0),
        })
    }
}

pub struct CountingFactory {
    pub store: CirrusStore,
    pub scratch: std::path::PathBuf,
    pub changes: Arc<dyn ChangesStorage>,
    pub created: AtomicUsize,
}

impl CountingFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl WorkerFactory for CountingFactory {
    fn create(&self, configuration: &DatabaseConfiguration, partition: usize) -> ComputeWorker {
        self.created.fetch_add(1, Ordering::SeqCst);
        ComputeWorker::new(
            configuration,
            partition,
            self.changes.clone(),
            Arc::new(ObjectSnapshotStorage::new(
                self.store.clone(),
                &configuration.name,
                partition,
                &self.scratch,
            )),
            WorkerLimits::default(),
        )
    }
}
