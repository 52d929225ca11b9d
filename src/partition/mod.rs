//! Routing of worker requests onto one partition's lambdas.
//!
//! A request goes to the best candidate first and falls back to the next
//! one when the current candidate is slow, busy, or failing. Every reply's
//! worker state is gossiped into the infrastructure record.

pub mod invoker;
pub mod pool;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::config::ScalingTargetConfiguration;
use crate::error::{CirrusError, Result};
use crate::infrastructure::{InfrastructureStorage, LambdaInfrastructure, LambdaKind, PartitionInfrastructure};
use crate::types::DatabaseConfiguration;
use crate::worker::{WorkerReply, WorkerRequest};

pub use invoker::{InvocationTarget, WorkerFactory, WorkerInvoker};
pub use pool::LocalWorkerPool;

/// Untyped reply; callers decode the result they expect.
pub type RawReply = WorkerReply<serde_json::Value>;

/// Every lambda tier.
pub const ALL_TIERS: &[LambdaKind] = &[LambdaKind::Primary, LambdaKind::Secondary, LambdaKind::Fallback];

pub struct PartitionWorker {
    configuration: Arc<DatabaseConfiguration>,
    partition: usize,
    invoker: Arc<dyn WorkerInvoker>,
    infrastructure: Arc<dyn InfrastructureStorage>,
    invoke_timeout: Duration,
}

impl PartitionWorker {
    pub fn new(
        configuration: Arc<DatabaseConfiguration>,
        partition: usize,
        invoker: Arc<dyn WorkerInvoker>,
        infrastructure: Arc<dyn InfrastructureStorage>,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            configuration,
            partition,
            invoker,
            infrastructure,
            invoke_timeout,
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Primary lambdas in the home region, then secondaries in the home
    /// region, then everything in other regions.
    pub fn candidates<'a>(&self, partition: &'a PartitionInfrastructure) -> Vec<&'a LambdaInfrastructure> {
        let home = &self.configuration.region;
        let mut lambdas: Vec<&LambdaInfrastructure> = partition.lambdas.iter().collect();
        lambdas.sort_by_key(|l| {
            let remote = l.region != *home;
            let tier = match l.kind {
                LambdaKind::Primary => 0,
                LambdaKind::Secondary => 1,
                LambdaKind::Fallback => 2,
            };
            (remote, tier)
        });
        lambdas
    }

    fn target(&self, lambda: &LambdaInfrastructure) -> InvocationTarget {
        InvocationTarget {
            configuration: self.configuration.clone(),
            partition: self.partition,
            lambda: lambda.name.clone(),
            concurrency: lambda.concurrency,
        }
    }

    /// Invoke one lambda on a detached task. The task reports the replying
    /// instance's state before finishing, even if nobody awaits it anymore.
    fn launch(
        &self,
        lambda: &LambdaInfrastructure,
        request: WorkerRequest,
    ) -> tokio::task::JoinHandle<Result<RawReply>> {
        let target = self.target(lambda);
        let kind = lambda.kind.as_str();
        let invoker = self.invoker.clone();
        let infrastructure = self.infrastructure.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let reply = match invoker.invoke(&target, request).await {
                Ok(response) => response.into_reply::<serde_json::Value>(),
                Err(e) => Err(e),
            };
            crate::metrics::WORKER_INVOCATION_DURATION
                .with_label_values(&[kind])
                .observe(start.elapsed().as_secs_f64());

            let outcome = match &reply {
                Ok(_) => "ok",
                Err(CirrusError::Worker { status: 429, .. }) => "busy",
                Err(_) => "error",
            };
            crate::metrics::WORKER_INVOCATIONS_TOTAL
                .with_label_values(&[kind, outcome])
                .inc();

            if let Ok(reply) = &reply {
                if let Err(e) = infrastructure
                    .process_state(&target.configuration.name, &target.lambda, &reply.state)
                    .await
                {
                    warn!(lambda = %target.lambda, error = %e, "failed to record worker state");
                }
            }
            reply.map_err(|e| match e {
                CirrusError::Worker { status: 429, .. } => CirrusError::WorkerBusy {
                    lambda: target.lambda.clone(),
                },
                other => other,
            })
        })
    }

    /// Send one request to the partition, falling back across candidates.
    #[instrument(skip(self, partition, request), fields(database = %self.configuration.name, partition = self.partition, method = request.method()))]
    pub async fn request(
        &self,
        partition: &PartitionInfrastructure,
        request: WorkerRequest,
    ) -> Result<RawReply> {
        let candidates = self.candidates(partition);
        if candidates.is_empty() {
            return Err(CirrusError::NoActiveLambda {
                partition: self.partition,
            });
        }

        let mut in_flight = FuturesUnordered::new();
        let mut next = 0;
        let mut last_error: Option<CirrusError> = None;

        in_flight.push(self.launch(candidates[next], request.clone()));
        next += 1;

        loop {
            if in_flight.is_empty() {
                if next >= candidates.len() {
                    break;
                }
                in_flight.push(self.launch(candidates[next], request.clone()));
                next += 1;
                continue;
            }

            let timeout = tokio::time::sleep(self.invoke_timeout);
            tokio::pin!(timeout);
            let can_race = next < candidates.len();

            tokio::select! {
                Some(joined) = in_flight.next() => {
                    let result = joined.unwrap_or_else(|e| Err(CirrusError::Worker {
                        status: 500,
                        message: format!("invocation task failed: {e}"),
                    }));
                    match result {
                        Ok(reply) => return Ok(reply),
                        Err(e) if e.is_retryable() => {
                            if matches!(e, CirrusError::WorkerBusy { .. }) {
                                debug!(error = %e, "candidate busy, trying next");
                            } else {
                                warn!(error = %e, "candidate failed, trying next");
                            }
                            last_error = Some(e);
                            if next < candidates.len() {
                                self.record_fallback();
                                in_flight.push(self.launch(candidates[next], request.clone()));
                                next += 1;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = &mut timeout, if can_race => {
                    debug!(next_lambda = %candidates[next].name, "candidate slow, racing next");
                    self.record_fallback();
                    in_flight.push(self.launch(candidates[next], request.clone()));
                    next += 1;
                }
                else => break,
            }
        }

        Err(CirrusError::AllLambdasFailed {
            partition: self.partition,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn record_fallback(&self) {
        crate::metrics::LAMBDA_FALLBACKS_TOTAL
            .with_label_values(&[&self.configuration.name])
            .inc();
    }

    /// Issue the request to the warm-instance target of each tier in
    /// `scope`, spreading calls round-robin over that tier's lambdas.
    #[instrument(skip(self, partition, request, scaling), fields(database = %self.configuration.name, partition = self.partition, method = request.method()))]
    pub async fn request_all(
        &self,
        partition: &PartitionInfrastructure,
        request: WorkerRequest,
        scope: &[LambdaKind],
        scaling: &ScalingTargetConfiguration,
    ) -> Vec<Result<RawReply>> {
        let mut handles = Vec::new();
        for kind in scope {
            let count = match kind {
                LambdaKind::Primary => scaling.warm_primary_instances,
                LambdaKind::Secondary => scaling.warm_secondary_instances,
                LambdaKind::Fallback => scaling.warm_regional_instances,
            };
            let lambdas: Vec<&LambdaInfrastructure> =
                partition.lambdas.iter().filter(|l| l.kind == *kind).collect();
            if lambdas.is_empty() || count == 0 {
                continue;
            }
            for i in 0..count {
                handles.push(self.launch(lambdas[i % lambdas.len()], request.clone()));
            }
        }
        debug!(invocations = handles.len(), "fanning out to warm instances");

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(CirrusError::Worker {
                        status: 500,
                        message: format!("invocation task failed: {e}"),
                    })
                })
            })
            .collect()
    }
}
