use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::changes::{ChangesStorage, MemoryChangesStorage, ObjectChangesStorage};
use crate::config::Config;
use crate::partition::WorkerFactory;
use crate::snapshot::{ObjectSnapshotStorage, SnapshotStorage};
use crate::storage::CirrusStore;
use crate::types::DatabaseConfiguration;
use crate::worker::{ComputeWorker, WorkerLimits};

/// Hands out the per-database storage handles shared by the orchestrator
/// and the compute workers it starts.
pub struct StorageFactory {
    store: CirrusStore,
    scratch_dir: PathBuf,
    in_memory: bool,
    page_size: usize,
    max_append_retries: u32,
    limits: WorkerLimits,
    changes: DashMap<String, Arc<dyn ChangesStorage>>,
}

impl StorageFactory {
    pub fn new(store: CirrusStore, config: &Config) -> Self {
        Self {
            store,
            scratch_dir: config.worker.scratch_dir.clone(),
            in_memory: config.storage.backend == "memory",
            page_size: config.changes.page_size,
            max_append_retries: config.changes.max_append_retries,
            limits: WorkerLimits::from_config(&config.worker),
            changes: DashMap::new(),
        }
    }

    pub fn store(&self) -> &CirrusStore {
        &self.store
    }

    /// Change log of a database. One handle per database is shared so the
    /// in-memory backend sees a single log.
    pub fn changes(&self, database: &str) -> Arc<dyn ChangesStorage> {
        self.changes
            .entry(database.to_string())
            .or_insert_with(|| -> Arc<dyn ChangesStorage> {
                if self.in_memory {
                    Arc::new(MemoryChangesStorage::new())
                } else {
                    Arc::new(ObjectChangesStorage::new(
                        self.store.clone(),
                        database,
                        self.page_size,
                        self.max_append_retries,
                    ))
                }
            })
            .value()
            .clone()
    }

    pub fn snapshots(&self, database: &str, partition: usize) -> Arc<dyn SnapshotStorage> {
        Arc::new(ObjectSnapshotStorage::new(
            self.store.clone(),
            database,
            partition,
            &self.scratch_dir,
        ))
    }

    /// Forget cached handles of a destroyed database.
    pub fn forget(&self, database: &str) {
        self.changes.remove(database);
    }
}

impl WorkerFactory for StorageFactory {
    fn create(&self, configuration: &DatabaseConfiguration, partition: usize) -> ComputeWorker {
        ComputeWorker::new(
            configuration,
            partition,
            self.changes(&configuration.name),
            self.snapshots(&configuration.name, partition),
            self.limits,
        )
    }
}
