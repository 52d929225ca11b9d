use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier of a vector within a database.
pub type Label = String;

/// Milliseconds since the Unix epoch. Change-log ordering and worker
/// watermarks are expressed in this unit.
pub type Timestamp = u64;

/// Distance space of a database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSpace {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// Cosine distance (1 - cosine similarity).
    Cosine,
    /// Inner product distance (1 - dot product).
    Ip,
}

impl std::fmt::Display for DistanceSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceSpace::L2 => write!(f, "l2"),
            DistanceSpace::Cosine => write!(f, "cosine"),
            DistanceSpace::Ip => write!(f, "ip"),
        }
    }
}

/// Attribute values that can be attached to vectors as metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A UTF-8 string value.
    String(String),
    /// A 64-bit signed integer value.
    Integer(i64),
    /// A 64-bit floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// A list of UTF-8 string values.
    StringList(Vec<String>),
    /// A list of 64-bit signed integer values.
    IntegerList(Vec<i64>),
    /// A list of 64-bit floating-point values.
    FloatList(Vec<f64>),
}

pub type Metadata = HashMap<String, AttributeValue>;

/// A labelled vector with optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub label: Label,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// One entry of the append-only change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StoredVectorChange {
    Add {
        timestamp: Timestamp,
        vector: VectorEntry,
    },
    Remove {
        timestamp: Timestamp,
        label: Label,
    },
}

impl StoredVectorChange {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            StoredVectorChange::Add { timestamp, .. }
            | StoredVectorChange::Remove { timestamp, .. } => *timestamp,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            StoredVectorChange::Add { vector, .. } => &vector.label,
            StoredVectorChange::Remove { label, .. } => label,
        }
    }
}

/// A k-nearest-neighbour query.
///
/// `k` is signed so that a negative value survives deserialization and is
/// rejected by the worker with a validation error instead of a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnnQuery {
    pub vector: Vec<f32>,
    pub k: i64,
    #[serde(default)]
    pub include_vectors: bool,
}

/// A single nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub label: Label,
    pub distance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Vector count and dimensionality of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCount {
    pub count: usize,
    pub dimensions: usize,
}

/// Named secret token that grants access to a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretToken {
    pub name: String,
    pub value: String,
}

fn default_partitions() -> usize {
    1
}

/// Immutable identity of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfiguration {
    pub name: String,
    pub region: String,
    pub dimensions: usize,
    #[serde(default)]
    pub space: DistanceSpace,
    /// Fixed number of partitions; labels are hashed onto them.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default)]
    pub secret_tokens: Vec<SecretToken>,
    /// Name of the statistics sink, stored for clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<String>,
}

impl DatabaseConfiguration {
    /// Copy of this configuration with token values removed.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for token in &mut copy.secret_tokens {
            token.value = String::new();
        }
        copy
    }
}

/// Map a label onto one of `partitions` partitions.
pub fn partition_of(label: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (xxhash_rust::xxh3::xxh3_64(label.as_bytes()) % partitions as u64) as usize
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_space_serde_roundtrip() {
        for (variant, expected_json) in [
            (DistanceSpace::L2, "\"l2\""),
            (DistanceSpace::Cosine, "\"cosine\""),
            (DistanceSpace::Ip, "\"ip\""),
        ] {
            let json = serde_json::to_string(&variant).unwrap();
            assert_eq!(json, expected_json);
            let back: DistanceSpace = serde_json::from_str(&json).unwrap();
            assert_eq!(back, variant);
        }
    }

    #[test]
    fn test_stored_change_wire_format() {
        let add: StoredVectorChange = serde_json::from_str(
            r#"{"action":"add","timestamp":5,"vector":{"label":"t","vector":[1.0,2.0,3.0]}}"#,
        )
        .unwrap();
        assert_eq!(add.timestamp(), 5);
        assert_eq!(add.label(), "t");

        let remove: StoredVectorChange =
            serde_json::from_str(r#"{"action":"remove","timestamp":6,"label":"t"}"#).unwrap();
        assert_eq!(remove.timestamp(), 6);
        assert_eq!(remove.label(), "t");

        let json = serde_json::to_value(&remove).unwrap();
        assert_eq!(json["action"], "remove");
    }

    #[test]
    fn test_negative_k_deserializes() {
        let q: KnnQuery = serde_json::from_str(r#"{"vector":[1.0],"k":-1}"#).unwrap();
        assert_eq!(q.k, -1);
        assert!(!q.include_vectors);
    }

    #[test]
    fn test_configuration_defaults_and_redaction() {
        let cfg: DatabaseConfiguration = serde_json::from_str(
            r#"{"name":"db","region":"eu-west-1","dimensions":3,
                "secretTokens":[{"name":"ci","value":"s3cr3t"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.partitions, 1);
        assert_eq!(cfg.space, DistanceSpace::L2);
        let redacted = cfg.redacted();
        assert_eq!(redacted.secret_tokens[0].name, "ci");
        assert!(redacted.secret_tokens[0].value.is_empty());
    }

    #[test]
    fn test_partition_of_is_stable_and_in_range() {
        assert_eq!(partition_of("anything", 1), 0);
        for label in ["a", "b", "c", "vector-42"] {
            let p = partition_of(label, 4);
            assert!(p < 4);
            assert_eq!(p, partition_of(label, 4));
        }
    }
}
