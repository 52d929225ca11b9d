use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Observable state of one compute worker instance, returned with every
/// reply and gossiped into the infrastructure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    /// Random per process lifetime; a new id means a cold instance.
    pub instance_id: String,
    pub partition_index: usize,
    /// Watermark: every change with a timestamp at or below it is applied.
    pub last_update: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<Timestamp>,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub ephemeral_used: u64,
    pub ephemeral_limit: u64,
}

/// Resource limits reported in [`WorkerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    pub memory_limit: u64,
    pub ephemeral_limit: u64,
}

impl WorkerLimits {
    pub fn from_config(config: &crate::config::WorkerConfig) -> Self {
        Self {
            memory_limit: config.memory_limit_mb * 1024 * 1024,
            ephemeral_limit: config.ephemeral_limit_mb * 1024 * 1024,
        }
    }
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self::from_config(&crate::config::WorkerConfig::default())
    }
}
