//! Index capability used by compute workers.
//!
//! The worker only needs a labelled k-NN structure that can be persisted to
//! and restored from a snapshot file. `FlatIndex` is the exact brute-force
//! implementation.

pub mod distance;
pub mod flat;

use std::path::Path;

use crate::error::Result;
use crate::types::{DistanceSpace, SearchResult, VectorEntry};

pub use flat::FlatIndex;

/// A mutable, persistable nearest-neighbour index over labelled vectors.
pub trait Index: Send + Sync {
    /// Dimensionality every stored and queried vector must have.
    fn dimensions(&self) -> usize;

    fn space(&self) -> DistanceSpace;

    /// Insert `entry`. An entry with the same label must not already exist.
    fn add(&mut self, entry: VectorEntry) -> Result<()>;

    /// Remove by label. Returns whether an entry was present.
    fn remove(&mut self, label: &str) -> bool;

    fn contains(&self, label: &str) -> bool;

    /// Up to `k` nearest entries, closest first, vectors included.
    fn knn(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>>;

    fn count(&self) -> usize;

    /// Persist the full index to `path`.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replace the contents of this index with the file at `path`.
    fn load(&mut self, path: &Path) -> Result<()>;
}
