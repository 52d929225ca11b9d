use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use super::invoker::{InvocationTarget, WorkerFactory, WorkerInvoker};
use crate::error::Result;
use crate::worker::{ComputeWorker, WorkerRequest, WorkerResponse};

type Slot = Arc<Mutex<ComputeWorker>>;

/// In-process lambda emulation.
///
/// Each lambda owns a set of compute worker instances. An instance serves
/// one call at a time; a call takes an idle instance, cold-starts a new one
/// while the lambda is under its concurrency limit, or is answered 429.
pub struct LocalWorkerPool {
    factory: Arc<dyn WorkerFactory>,
    lambdas: DashMap<String, Arc<std::sync::Mutex<Vec<Slot>>>>,
}

impl LocalWorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            lambdas: DashMap::new(),
        }
    }

    fn instances(&self, lambda: &str) -> Arc<std::sync::Mutex<Vec<Slot>>> {
        self.lambdas
            .entry(lambda.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Take an idle instance or cold-start one. `None` means every instance
    /// is busy and the lambda is at its concurrency limit.
    fn acquire(&self, target: &InvocationTarget) -> Option<OwnedMutexGuard<ComputeWorker>> {
        let instances = self.instances(&target.lambda);
        let mut instances = instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(guard) = instances.iter().find_map(|slot| slot.clone().try_lock_owned().ok()) {
            return Some(guard);
        }
        if instances.len() >= target.concurrency {
            return None;
        }

        let worker = self.factory.create(&target.configuration, target.partition);
        debug!(
            lambda = %target.lambda,
            instance = worker.instance_id(),
            running = instances.len() + 1,
            "cold-starting worker instance"
        );
        crate::metrics::WORKER_INSTANCES_CREATED_TOTAL
            .with_label_values(&[&target.lambda])
            .inc();
        let slot: Slot = Arc::new(Mutex::new(worker));
        let guard = slot.clone().try_lock_owned().ok();
        instances.push(slot);
        guard
    }

    /// Number of instances a lambda has started.
    pub fn instance_count(&self, lambda: &str) -> usize {
        self.lambdas
            .get(lambda)
            .map(|instances| {
                instances
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .unwrap_or(0)
    }

    /// Total instances across every lambda.
    pub fn total_instances(&self) -> usize {
        self.lambdas
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .sum()
    }

    /// Drop every instance of the named lambdas.
    pub fn evict<'a>(&self, lambdas: impl IntoIterator<Item = &'a str>) {
        for lambda in lambdas {
            self.lambdas.remove(lambda);
        }
    }
}

#[async_trait]
impl WorkerInvoker for LocalWorkerPool {
    #[instrument(skip(self, target, request), fields(lambda = %target.lambda, method = request.method()))]
    async fn invoke(&self, target: &InvocationTarget, request: WorkerRequest) -> Result<WorkerResponse> {
        let Some(mut worker) = self.acquire(target) else {
            debug!("lambda at concurrency limit");
            return Ok(WorkerResponse::error(
                429,
                format!("lambda {} is busy", target.lambda),
            ));
        };
        Ok(worker.handle(request).await)
    }
}
