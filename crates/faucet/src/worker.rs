//! Request worker: finds pending requests and hands them to their network's processor.
//!
//! Every network's request collection is scanned on a fixed interval, so
//! requests created while the worker was down are picked up by the first scan.
//! A request is dispatched at most once per process at a time; the processor's
//! `Pending` guard covers redelivery after it finished.

use crate::config::{FaucetConfig, WorkerConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::transfer::FaucetHandler;
use dashmap::DashSet;
use drip_common::traits::LockStore;
use drip_common::types::record_path;
use drip_core::{AccountPool, ExecutionResult, RequestProcessor, RequestStatus};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// One processor per configured network, each with the faucet transfer handler.
pub fn build_processors(store: Arc<dyn LockStore>, config: &FaucetConfig) -> FaucetResult<Vec<Arc<RequestProcessor>>> {
    config
        .networks
        .iter()
        .map(|(name, network)| {
            let namespace = config.account_namespace(name)?;
            let pool = Arc::new(AccountPool::new(store.clone(), namespace, config.pool.clone()));
            let handler = Arc::new(FaucetHandler::new(name.clone(), network.clone()));
            Ok(Arc::new(RequestProcessor::new(store.clone(), pool, handler, name.clone())))
        })
        .collect()
}

pub struct RequestWorker {
    store: Arc<dyn LockStore>,
    processors: Vec<Arc<RequestProcessor>>,
    metrics: Arc<FaucetMetrics>,
    /// `<network>/requests/<key>` of every request being processed here
    in_flight: Arc<DashSet<String>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    poll_interval: Duration,
}

impl RequestWorker {
    pub fn new(
        store: Arc<dyn LockStore>,
        processors: Vec<Arc<RequestProcessor>>,
        metrics: Arc<FaucetMetrics>,
        config: &WorkerConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent_requests.max(1);
        Self {
            store,
            processors,
            metrics,
            in_flight: Arc::new(DashSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Scans every network once and dispatches its pending requests.
    ///
    /// Returns how many requests were dispatched. Waits for a free slot when
    /// `max_concurrent_requests` are already running.
    pub async fn poll_once(&self) -> FaucetResult<usize> {
        let mut dispatched = 0;
        for processor in &self.processors {
            let collection = processor.requests_collection();
            let records = self.store.read_collection(&collection).await?;

            for (key, snapshot) in records {
                if snapshot.get("status").and_then(Value::as_str) != Some(RequestStatus::Pending.as_str()) {
                    continue;
                }
                let path = record_path(&collection, &key);
                if !self.in_flight.insert(path.clone()) {
                    continue;
                }

                let permit = match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        self.in_flight.remove(&path);
                        return Err(FaucetError::InternalError(e.to_string()));
                    }
                };

                debug!(request = %key, network = processor.network(), "Dispatching request");
                let processor = processor.clone();
                let metrics = self.metrics.clone();
                let in_flight = self.in_flight.clone();
                tokio::spawn(async move {
                    metrics.requests_in_flight.inc();
                    let started = Instant::now();
                    let result = match processor.process_snapshot(&key, snapshot).await {
                        Ok(Some(result)) => Some(result),
                        Ok(None) => None,
                        Err(e) => {
                            error!(request = %key, network = processor.network(), "Request failed: {}", e);
                            Some(ExecutionResult::OtherError)
                        }
                    };
                    if let Some(result) = result {
                        metrics.record_result(processor.network(), result, started.elapsed());
                    }
                    metrics.requests_in_flight.dec();
                    in_flight.remove(&path);
                    drop(permit);
                });
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Waits until every dispatched request has finished.
    pub async fn drain(&self) {
        match self.permits.acquire_many(self.max_concurrent as u32).await {
            Ok(_permits) => debug!("All requests finished"),
            Err(e) => error!("Failed to drain request worker: {}", e),
        }
    }

    /// Polls until `shutdown` resolves, then waits for running requests.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            "Request worker started for {} networks (every {:?}, up to {} at once)",
            self.processors.len(),
            self.poll_interval,
            self.max_concurrent
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Dispatched {} requests", n),
                        Err(e) => error!("Request poll failed: {}", e),
                    }
                }
            }
        }

        info!("Request worker stopping, waiting for {} requests", self.in_flight());
        self.drain().await;
    }
}
