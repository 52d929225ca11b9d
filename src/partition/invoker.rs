use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::DatabaseConfiguration;
use crate::worker::{ComputeWorker, WorkerRequest, WorkerResponse};

/// Addresses one lambda of one database partition.
#[derive(Debug, Clone)]
pub struct InvocationTarget {
    pub configuration: Arc<DatabaseConfiguration>,
    pub partition: usize,
    pub lambda: String,
    /// Instances the lambda may run at once.
    pub concurrency: usize,
}

/// Transport to compute workers.
///
/// Worker-level failures come back as a non-200 [`WorkerResponse`]; an
/// `Err` means the invocation itself failed.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(&self, target: &InvocationTarget, request: WorkerRequest) -> Result<WorkerResponse>;
}

/// Builds cold compute worker instances.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, configuration: &DatabaseConfiguration, partition: usize) -> ComputeWorker;
}
