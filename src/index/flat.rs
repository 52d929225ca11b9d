use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::distance::compute_distance;
use super::Index;
use crate::error::{CirrusError, Result};
use crate::types::{DistanceSpace, Label, SearchResult, VectorEntry};

const SNAPSHOT_FORMAT_MSGPACK: u8 = 0x01;

/// Exact brute-force index. Every query scans all entries.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimensions: usize,
    space: DistanceSpace,
    entries: HashMap<Label, VectorEntry>,
}

/// On-disk layout: `[0x01] [msgpack payload]`.
#[derive(Serialize, Deserialize)]
struct FlatIndexFile {
    dimensions: usize,
    space: DistanceSpace,
    entries: Vec<VectorEntry>,
}

impl FlatIndex {
    pub fn new(dimensions: usize, space: DistanceSpace) -> Self {
        Self {
            dimensions,
            space,
            entries: HashMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<VectorEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.label.cmp(&b.label));
        let file = FlatIndexFile {
            dimensions: self.dimensions,
            space: self.space,
            entries,
        };
        let msgpack = rmp_serde::to_vec_named(&file)?;
        let mut data = Vec::with_capacity(1 + msgpack.len());
        data.push(SNAPSHOT_FORMAT_MSGPACK);
        data.extend_from_slice(&msgpack);
        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match data.first() {
            Some(&SNAPSHOT_FORMAT_MSGPACK) => {
                let file: FlatIndexFile = rmp_serde::from_slice(&data[1..])?;
                let mut entries = HashMap::with_capacity(file.entries.len());
                for entry in file.entries {
                    if entry.vector.len() != file.dimensions {
                        return Err(CirrusError::Index(format!(
                            "snapshot entry {} has {} dimensions, index has {}",
                            entry.label,
                            entry.vector.len(),
                            file.dimensions
                        )));
                    }
                    entries.insert(entry.label.clone(), entry);
                }
                Ok(Self {
                    dimensions: file.dimensions,
                    space: file.space,
                    entries,
                })
            }
            Some(other) => Err(CirrusError::Index(format!(
                "unknown snapshot format byte {other:#04x}"
            ))),
            None => Err(CirrusError::Index("empty snapshot file".into())),
        }
    }
}

impl Index for FlatIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn space(&self) -> DistanceSpace {
        self.space
    }

    fn add(&mut self, entry: VectorEntry) -> Result<()> {
        if entry.vector.len() != self.dimensions {
            return Err(CirrusError::DimensionMismatch {
                expected: self.dimensions,
                actual: entry.vector.len(),
            });
        }
        if self.entries.contains_key(&entry.label) {
            return Err(CirrusError::Index(format!(
                "label already present: {}",
                entry.label
            )));
        }
        self.entries.insert(entry.label.clone(), entry);
        Ok(())
    }

    fn remove(&mut self, label: &str) -> bool {
        self.entries.remove(label).is_some()
    }

    fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    fn knn(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if query.len() != self.dimensions {
            return Err(CirrusError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, &VectorEntry)> = self
            .entries
            .values()
            .map(|e| (compute_distance(query, &e.vector, self.space), e))
            .collect();
        // Ties broken by label so results are deterministic.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.label.cmp(&b.1.label)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, e)| SearchResult {
                label: e.label.clone(),
                distance,
                vector: Some(e.vector.clone()),
                metadata: e.metadata.clone(),
            })
            .collect())
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn save(&self, path: &Path) -> Result<()> {
        let data = self.to_bytes()?;
        std::fs::write(path, &data)?;
        debug!(path = %path.display(), bytes = data.len(), vectors = self.entries.len(), "saved flat index");
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let loaded = Self::from_bytes(&data)?;
        if loaded.dimensions != self.dimensions {
            return Err(CirrusError::DimensionMismatch {
                expected: self.dimensions,
                actual: loaded.dimensions,
            });
        }
        *self = loaded;
        debug!(path = %path.display(), vectors = self.entries.len(), "loaded flat index");
        Ok(())
    }
}
