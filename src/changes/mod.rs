//! Append-only log of vector mutations.
//!
//! The log is the source of truth between flushes: snapshots cover a prefix
//! of it, and readers patch stale workers with its tail.

pub mod memory;
pub mod object;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::error::Result;
use crate::types::{StoredVectorChange, Timestamp};

pub use memory::MemoryChangesStorage;
pub use object::ObjectChangesStorage;

/// Lazily fetched, timestamp-ordered changes.
pub type ChangeStream = BoxStream<'static, Result<StoredVectorChange>>;

/// Result of an append. Items the backend could not persist are handed back
/// so the caller can retry or fail the request.
#[derive(Debug, Default)]
pub struct AddChangesOutcome {
    pub unprocessed_items: Vec<StoredVectorChange>,
}

impl AddChangesOutcome {
    pub fn is_complete(&self) -> bool {
        self.unprocessed_items.is_empty()
    }
}

#[async_trait]
pub trait ChangesStorage: Send + Sync {
    /// Append a batch of changes.
    async fn add(&self, changes: Vec<StoredVectorChange>) -> Result<AddChangesOutcome>;

    /// Every change with `timestamp >= after`, in timestamp order. Each call
    /// starts a fresh read, so a failed stream can simply be requested again.
    async fn changes_after(&self, after: Timestamp) -> Result<ChangeStream>;

    /// Drain `changes_after` into memory.
    async fn get_all_changes_after(&self, after: Timestamp) -> Result<Vec<StoredVectorChange>> {
        self.changes_after(after).await?.try_collect().await
    }

    /// Drop every change with `timestamp < before`. Returns how many were
    /// removed.
    async fn clear_before(&self, before: Timestamp) -> Result<u64>;

    /// Number of changes currently held.
    async fn count(&self) -> Result<u64>;
}
