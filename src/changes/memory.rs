use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{AddChangesOutcome, ChangeStream, ChangesStorage};
use crate::error::Result;
use crate::types::{StoredVectorChange, Timestamp};

/// In-process change log ordered by `(timestamp, arrival)`.
#[derive(Debug, Default)]
pub struct MemoryChangesStorage {
    changes: RwLock<BTreeMap<(Timestamp, u64), StoredVectorChange>>,
    seq: AtomicU64,
}

impl MemoryChangesStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangesStorage for MemoryChangesStorage {
    async fn add(&self, changes: Vec<StoredVectorChange>) -> Result<AddChangesOutcome> {
        let mut log = self.changes.write().await;
        for change in changes {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            log.insert((change.timestamp(), seq), change);
        }
        Ok(AddChangesOutcome::default())
    }

    async fn changes_after(&self, after: Timestamp) -> Result<ChangeStream> {
        let log = self.changes.read().await;
        let tail: Vec<StoredVectorChange> = log
            .range((after, 0)..)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(futures::stream::iter(tail.into_iter().map(Ok)).boxed())
    }

    async fn clear_before(&self, before: Timestamp) -> Result<u64> {
        let mut log = self.changes.write().await;
        let kept = log.split_off(&(before, 0));
        let removed = log.len() as u64;
        *log = kept;
        Ok(removed)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.changes.read().await.len() as u64)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VectorEntry;

    fn add(ts: Timestamp, label: &str) -> StoredVectorChange {
        StoredVectorChange::Add {
            timestamp: ts,
            vector: VectorEntry {
                label: label.into(),
                vector: vec![ts as f32],
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

    #[tokio::test]
    async fn test_changes_after_is_inclusive_and_ordered() {
        let log = MemoryChangesStorage::new();
        log.add(vec![add(30, "c"), add(10, "a")]).await.unwrap();
        log.add(vec![remove(20, "a")]).await.unwrap();

        let all = log.get_all_changes_after(0).await.unwrap();
        let ts: Vec<_> = all.iter().map(|c| c.timestamp()).collect();
        assert_eq!(ts, vec![10, 20, 30]);

        let tail = log.get_all_changes_after(20).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], remove(20, "a"));
    }

    #[tokio::test]
    async fn test_same_timestamp_keeps_arrival_order() {
        let log = MemoryChangesStorage::new();
        log.add(vec![add(5, "x"), remove(5, "x")]).await.unwrap();
        let all = log.get_all_changes_after(5).await.unwrap();
        assert!(matches!(all[0], StoredVectorChange::Add { .. }));
        assert!(matches!(all[1], StoredVectorChange::Remove { .. }));
    }

    #[tokio::test]
    async fn test_clear_before_is_exclusive() {
        let log = MemoryChangesStorage::new();
        log.add(vec![add(1, "a"), add(2, "b"), add(3, "c")])
            .await
            .unwrap();
        assert_eq!(log.clear_before(2).await.unwrap(), 1);
        assert_eq!(log.count().await.unwrap(), 2);
        let all = log.get_all_changes_after(0).await.unwrap();
        assert_eq!(all[0].timestamp(), 2);
    }
}
