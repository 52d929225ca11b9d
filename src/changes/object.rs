use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use ulid::Ulid;

use super::{AddChangesOutcome, ChangeStream, ChangesStorage};
use crate::error::{CirrusError, Result};
use crate::storage::CirrusStore;
use crate::types::{StoredVectorChange, Timestamp};

/// Base delay for retrying a colliding batch key.
const RETRY_BASE_DELAY_MS: u64 = 10;

/// One immutable object holding every change of an append that shares a
/// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeBatch {
    timestamp: Timestamp,
    changes: Vec<StoredVectorChange>,
    checksum: u64,
}

impl ChangeBatch {
    fn new(timestamp: Timestamp, changes: Vec<StoredVectorChange>) -> Result<Self> {
        let checksum = Self::compute_checksum(&changes)?;
        Ok(Self {
            timestamp,
            changes,
            checksum,
        })
    }

    fn compute_checksum(changes: &[StoredVectorChange]) -> Result<u64> {
        let canonical = serde_json::to_vec(changes)?;
        Ok(xxhash_rust::xxh3::xxh3_64(&canonical))
    }

    fn from_bytes(key: &str, data: &[u8]) -> Result<Self> {
        let batch: Self = serde_json::from_slice(data)?;
        if Self::compute_checksum(&batch.changes)? != batch.checksum {
            return Err(CirrusError::Serialization(format!(
                "checksum mismatch in change batch {key}"
            )));
        }
        Ok(batch)
    }
}

/// Parsed form of `{db}/changes/{timestamp:020}-{ulid}-{count}.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchKey {
    key: String,
    timestamp: Timestamp,
    count: u64,
}

impl BatchKey {
    fn format(database: &str, timestamp: Timestamp, id: &Ulid, count: usize) -> String {
        format!("{database}/changes/{timestamp:020}-{id}-{count}.json")
    }

    fn parse(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next()?.strip_suffix(".json")?;
        let mut parts = name.splitn(3, '-');
        let timestamp = parts.next()?.parse().ok()?;
        let _id = parts.next()?;
        let count = parts.next()?.parse().ok()?;
        Some(Self {
            key: key.to_string(),
            timestamp,
            count,
        })
    }
}

/// Change log over the object store.
///
/// Appenders never share an object, so concurrent writers cannot lose each
/// other's changes. Keys sort by timestamp, which makes a prefix listing the
/// read order.
#[derive(Clone)]
pub struct ObjectChangesStorage {
    store: CirrusStore,
    database: String,
    page_size: usize,
    max_append_retries: u32,
}

impl ObjectChangesStorage {
    pub fn new(store: CirrusStore, database: &str, page_size: usize, max_append_retries: u32) -> Self {
        Self {
            store,
            database: database.to_string(),
            page_size: page_size.max(1),
            max_append_retries,
        }
    }

    fn prefix(&self) -> String {
        format!("{}/changes/", self.database)
    }

    async fn list_batches(&self) -> Result<Vec<BatchKey>> {
        let keys = self.store.list_prefix(&self.prefix()).await?;
        let mut batches = Vec::with_capacity(keys.len());
        for key in keys {
            match BatchKey::parse(&key) {
                Some(batch) => batches.push(batch),
                None => warn!(key = %key, "ignoring unrecognised object in change log"),
            }
        }
        Ok(batches)
    }

    /// Write one batch, retrying with a fresh id on key collision.
    /// Returns false when every attempt collided.
    async fn write_batch(&self, timestamp: Timestamp, changes: &[StoredVectorChange]) -> Result<bool> {
        let batch = ChangeBatch::new(timestamp, changes.to_vec())?;
        let data = Bytes::from(serde_json::to_vec(&batch)?);

        for attempt in 0..=self.max_append_retries {
            let key = BatchKey::format(&self.database, timestamp, &Ulid::new(), changes.len());
            match self.store.put_if_not_exists(&key, data.clone()).await {
                Ok(()) => {
                    debug!(key = %key, count = changes.len(), "wrote change batch");
                    return Ok(true);
                }
                Err(CirrusError::Conflict { .. }) if attempt < self.max_append_retries => {
                    let jitter = rand::thread_rng().gen_range(0..=RETRY_BASE_DELAY_MS);
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt) + jitter;
                    warn!(attempt, delay_ms = delay, "change batch key collision, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(CirrusError::Conflict { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl ChangesStorage for ObjectChangesStorage {
    #[instrument(skip(self, changes), fields(database = %self.database, count = changes.len()))]
    async fn add(&self, changes: Vec<StoredVectorChange>) -> Result<AddChangesOutcome> {
        let mut by_timestamp: BTreeMap<Timestamp, Vec<StoredVectorChange>> = BTreeMap::new();
        for change in changes {
            by_timestamp.entry(change.timestamp()).or_default().push(change);
        }

        let mut outcome = AddChangesOutcome::default();
        for (timestamp, group) in by_timestamp {
            if !self.write_batch(timestamp, &group).await? {
                outcome.unprocessed_items.extend(group);
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn changes_after(&self, after: Timestamp) -> Result<ChangeStream> {
        let batches: Vec<BatchKey> = self
            .list_batches()
            .await?
            .into_iter()
            .filter(|b| b.timestamp >= after)
            .collect();
        debug!(batches = batches.len(), after, "streaming change log");

        let store = self.store.clone();
        let stream = futures::stream::iter(batches)
            .map(move |batch| {
                let store = store.clone();
                async move {
                    let changes: Result<Vec<StoredVectorChange>> = match store.get(&batch.key).await {
                        Ok(data) => ChangeBatch::from_bytes(&batch.key, &data).map(|b| b.changes),
                        // Cleared between listing and reading.
                        Err(CirrusError::NotFound { .. }) => Ok(Vec::new()),
                        Err(e) => Err(e),
                    };
                    changes
                }
            })
            .buffered(self.page_size)
            .map_ok(|changes| futures::stream::iter(changes.into_iter().map(Ok::<_, CirrusError>)))
            .try_flatten()
            .boxed();
        Ok(stream)
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn clear_before(&self, before: Timestamp) -> Result<u64> {
        let stale: Vec<BatchKey> = self
            .list_batches()
            .await?
            .into_iter()
            .filter(|b| b.timestamp < before)
            .collect();
        let removed: u64 = stale.iter().map(|b| b.count).sum();
        let results =
            futures::future::join_all(stale.iter().map(|b| self.store.delete(&b.key))).await;
        for result in results {
            result?;
        }
        debug!(batches = stale.len(), removed, "cleared change log");
        Ok(removed)
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn count(&self) -> Result<u64> {
        Ok(self.list_batches().await?.iter().map(|b| b.count).sum())
    }
}
