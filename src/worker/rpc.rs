//! Wire envelope between the partition layer and compute workers.
//!
//! Requests are `{"method": ..., "args": ...}`. Every response carries an
//! HTTP-like status code and a JSON body: `{result, state}` on success,
//! `{error, status}` otherwise.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::state::WorkerState;
use crate::error::{CirrusError, Result};
use crate::types::{KnnQuery, StoredVectorChange, Timestamp};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum WorkerRequest {
    State,
    Query(QueryArgs),
    Update(UpdateArgs),
    SaveSnapshot,
    SaveSnapshotWithUpdates(FreshnessArgs),
    LoadLatestSnapshot,
    Count(CountArgs),
    Wake(WakeArgs),
}

impl WorkerRequest {
    pub fn method(&self) -> &'static str {
        match self {
            WorkerRequest::State => "state",
            WorkerRequest::Query(_) => "query",
            WorkerRequest::Update(_) => "update",
            WorkerRequest::SaveSnapshot => "saveSnapshot",
            WorkerRequest::SaveSnapshotWithUpdates(_) => "saveSnapshotWithUpdates",
            WorkerRequest::LoadLatestSnapshot => "loadLatestSnapshot",
            WorkerRequest::Count(_) => "count",
            WorkerRequest::Wake(_) => "wake",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryArgs {
    pub query: KnnQuery,
    /// Change-log tail applied before searching.
    #[serde(default)]
    pub updates: Vec<StoredVectorChange>,
    /// A worker whose watermark is below this reloads the latest snapshot.
    #[serde(default)]
    pub min_snapshot_timestamp: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountArgs {
    #[serde(default)]
    pub updates: Vec<StoredVectorChange>,
    #[serde(default)]
    pub min_snapshot_timestamp: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessArgs {
    #[serde(default)]
    pub min_snapshot_timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub changes: Vec<StoredVectorChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeArgs {
    pub duration_ms: u64,
}

/// Raw worker response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub status_code: u16,
    pub body: String,
}

/// Successful reply body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply<T> {
    pub result: T,
    pub state: WorkerState,
}

/// Error reply body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorBody {
    pub error: String,
    pub status: u16,
}

impl WorkerResponse {
    pub fn ok<T: Serialize>(result: &T, state: &WorkerState) -> Result<Self> {
        Ok(Self {
            status_code: 200,
            body: serde_json::to_string(&WorkerReply {
                result,
                state: state.clone(),
            })?,
        })
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = WorkerErrorBody {
            error: message.into(),
            status,
        };
        // Two plain fields; serialization cannot fail.
        let body = serde_json::to_string(&body)
            .unwrap_or_else(|_| format!("{{\"error\":\"worker error\",\"status\":{status}}}"));
        Self {
            status_code: status,
            body,
        }
    }

    pub fn from_error(err: &CirrusError) -> Self {
        Self::error(err.status_code(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    /// Decode the body, turning error replies into `CirrusError::Worker`.
    pub fn into_reply<T: DeserializeOwned>(self) -> Result<WorkerReply<T>> {
        if self.is_success() {
            return Ok(serde_json::from_str(&self.body)?);
        }
        let message = serde_json::from_str::<WorkerErrorBody>(&self.body)
            .map(|b| b.error)
            .unwrap_or(self.body);
        Err(CirrusError::Worker {
            status: self.status_code,
            message,
        })
    }
}

impl WorkerReply<serde_json::Value> {
    /// Decode the untyped result into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<WorkerReply<T>> {
        Ok(WorkerReply {
            result: serde_json::from_value(self.result)?,
            state: self.state,
        })
    }
}
