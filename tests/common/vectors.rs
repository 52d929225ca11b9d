use rand::Rng;

use cirrus::types::{StoredVectorChange, VectorEntry};

pub fn entry(label: &str, vector: Vec<f32>) -> VectorEntry {
    VectorEntry {
        label: label.to_string(),
        vector,
        metadata: None,
    }
}

/// `count` random vectors labelled `v0..`.
pub fn random_vectors(count: usize, dimensions: usize) -> Vec<VectorEntry> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            entry(
                &format!("v{i}"),
                (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            )
        })
        .collect()
}

pub fn add(timestamp: u64, label: &str, vector: Vec<f32>) -> StoredVectorChange {
    StoredVectorChange::Add {
        timestamp,
        vector: entry(label, vector),
    }
}

pub fn remove(timestamp: u64, label: &str) -> StoredVectorChange {
    StoredVectorChange::Remove {
        timestamp,
        label: label.to_string(),
    }
}
