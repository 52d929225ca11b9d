//! Immutable index snapshots per database partition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::error::{CirrusError, Result};
use crate::storage::CirrusStore;
use crate::types::Timestamp;

/// A persisted index covering every change with `timestamp <= self.timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub file_path: PathBuf,
    pub timestamp: Timestamp,
    pub database_name: String,
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Upload the index file at `path` as the snapshot for `timestamp`.
    async fn create(&self, path: &Path, timestamp: Timestamp) -> Result<Snapshot>;

    /// Download the newest snapshot into a scratch file owned by the
    /// caller. The caller removes the file once it has loaded it.
    async fn load_latest(&self) -> Result<Option<Snapshot>>;

    /// Timestamp of the newest snapshot without downloading it.
    async fn latest_timestamp(&self) -> Result<Option<Timestamp>>;

    /// Local scratch directory snapshot files live in.
    fn directory_path(&self) -> &Path;

    /// Delete snapshots older than `timestamp`. Returns how many were removed.
    async fn clear_before(&self, timestamp: Timestamp) -> Result<usize>;
}

/// Snapshots at `{db}/snapshots/p{partition}/{timestamp:020}.snap`.
///
/// Snapshot objects are never overwritten. Two snapshots at the same
/// timestamp cover the same changes, so the first upload wins.
#[derive(Clone)]
pub struct ObjectSnapshotStorage {
    store: CirrusStore,
    database: String,
    partition: usize,
    directory: PathBuf,
}

impl ObjectSnapshotStorage {
    pub fn new(store: CirrusStore, database: &str, partition: usize, scratch_dir: &Path) -> Self {
        Self {
            store,
            database: database.to_string(),
            partition,
            directory: scratch_dir.join(database).join(format!("p{partition}")),
        }
    }

    fn prefix(&self) -> String {
        format!("{}/snapshots/p{}/", self.database, self.partition)
    }

    fn key(&self, timestamp: Timestamp) -> String {
        format!("{}{timestamp:020}.snap", self.prefix())
    }

    fn parse_timestamp(key: &str) -> Option<Timestamp> {
        key.rsplit('/')
            .next()?
            .strip_suffix(".snap")?
            .parse()
            .ok()
    }

    async fn list(&self) -> Result<Vec<(Timestamp, String)>> {
        let keys = self.store.list_prefix(&self.prefix()).await?;
        let mut snapshots: Vec<(Timestamp, String)> = keys
            .into_iter()
            .filter_map(|key| Self::parse_timestamp(&key).map(|ts| (ts, key)))
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }
}

#[async_trait]
impl SnapshotStorage for ObjectSnapshotStorage {
    #[instrument(skip(self, path), fields(database = %self.database, partition = self.partition))]
    async fn create(&self, path: &Path, timestamp: Timestamp) -> Result<Snapshot> {
        let data = tokio::fs::read(path).await?;
        let size = data.len();
        match self.store.put_if_not_exists(&self.key(timestamp), Bytes::from(data)).await {
            Ok(()) => debug!(timestamp, size, "uploaded snapshot"),
            Err(CirrusError::Conflict { .. }) => {
                debug!(timestamp, "snapshot already exists, keeping it")
            }
            Err(e) => return Err(e),
        }
        Ok(Snapshot {
            file_path: path.to_path_buf(),
            timestamp,
            database_name: self.database.clone(),
        })
    }

    #[instrument(skip(self), fields(database = %self.database, partition = self.partition))]
    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let Some((timestamp, key)) = self.list().await?.pop() else {
            return Ok(None);
        };
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            // Trimmed by a concurrent flush; the caller retries on its next request.
            Err(CirrusError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Every load gets its own file; instances of one partition share
        // the directory.
        tokio::fs::create_dir_all(&self.directory).await?;
        let name = format!("{timestamp:020}-{}", uuid::Uuid::new_v4().simple());
        let partial = self.directory.join(format!("{name}.part"));
        let file_path = self.directory.join(format!("{name}.snap"));
        if let Err(e) = tokio::fs::write(&partial, &data).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &file_path).await?;
        debug!(timestamp, size = data.len(), "downloaded snapshot");
        Ok(Some(Snapshot {
            file_path,
            timestamp,
            database_name: self.database.clone(),
        }))
    }

    async fn latest_timestamp(&self) -> Result<Option<Timestamp>> {
        Ok(self.list().await?.pop().map(|(ts, _)| ts))
    }

    fn directory_path(&self) -> &Path {
        &self.directory
    }

    #[instrument(skip(self), fields(database = %self.database, partition = self.partition))]
    async fn clear_before(&self, timestamp: Timestamp) -> Result<usize> {
        let stale: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|(ts, _)| *ts < timestamp)
            .map(|(_, key)| key)
            .collect();
        for key in &stale {
            self.store.delete(key).await?;
        }
        debug!(removed = stale.len(), "cleared snapshots");
        Ok(stale.len())
    }
}
