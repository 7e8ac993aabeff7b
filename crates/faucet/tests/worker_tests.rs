//! Request worker dispatch, deduplication and shutdown under paused time.

use async_trait::async_trait;
use drip_common::traits::LockStore;
use drip_common::utils::logging::init_test_logging;
use drip_core::{
    AccountPool, AccountRecord, Credential, PoolOptions, RequestHandler, RequestProcessor, RequestRecord,
    TransferReceipt,
};
use drip_faucet::{FaucetMetrics, RequestWorker, WorkerConfig};
use drip_storage::MemoryStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = "alfajores";

#[derive(Default)]
struct SlowHandler {
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle(&self, request: &RequestRecord, _account: &AccountRecord) -> anyhow::Result<TransferReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(TransferReceipt {
            tx_hash: Some(format!("0xhash-{}", request.beneficiary)),
            ..TransferReceipt::default()
        })
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    handler: Arc<SlowHandler>,
    metrics: Arc<FaucetMetrics>,
    worker: Arc<RequestWorker>,
}

async fn fixture(accounts: usize, max_concurrent_requests: usize) -> Fixture {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(AccountPool::new(store.clone(), NETWORK, PoolOptions::new(20, 5_000, 5_000)));
    for i in 0..accounts {
        pool.add_account(&AccountRecord::new(Credential::new(format!("0x{:02x}", i)), format!("0xa{}", i)))
            .await
            .unwrap();
    }
    let handler = Arc::new(SlowHandler::default());
    let processor = Arc::new(RequestProcessor::new(store.clone(), pool, handler.clone(), NETWORK));
    let metrics = Arc::new(FaucetMetrics::new().unwrap());
    let worker = Arc::new(RequestWorker::new(
        store.clone(),
        vec![processor],
        metrics.clone(),
        &WorkerConfig {
            poll_interval_ms: 50,
            max_concurrent_requests,
        },
    ));
    Fixture {
        store,
        handler,
        metrics,
        worker,
    }
}

impl Fixture {
    async fn submit(&self, record: Value) -> String {
        self.store.push("alfajores/requests", record).await.unwrap()
    }

    async fn status(&self, key: &str) -> Value {
        self.store.read_record("alfajores/requests", key).await.unwrap().unwrap()["status"].clone()
    }

    fn count(&self, result: &str) -> u64 {
        self.metrics.requests_total.with_label_values(&[NETWORK, result]).get()
    }
}

fn pending(beneficiary: &str) -> Value {
    json!({"status": "Pending", "beneficiary": beneficiary, "type": "Faucet"})
}

#[tokio::test(start_paused = true)]
async fn test_poll_dispatches_pending_requests_once() {
    let f = fixture(2, 8).await;
    let a = f.submit(pending("0x01")).await;
    let b = f.submit(pending("0x02")).await;
    let c = f.submit(pending("0x03")).await;
    let done = f
        .submit(json!({"status": "Done", "beneficiary": "0x04", "type": "Faucet"}))
        .await;

    assert_eq!(f.worker.poll_once().await.unwrap(), 3);
    assert_eq!(f.worker.poll_once().await.unwrap(), 0);

    f.worker.drain().await;

    for key in [&a, &b, &c] {
        assert_eq!(f.status(key).await, "Done");
    }
    assert_eq!(f.status(&done).await, "Done");
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(f.count("Ok"), 3);
    assert_eq!(f.worker.in_flight(), 0);
    assert_eq!(f.metrics.requests_in_flight.get(), 0);

    assert_eq!(f.worker.poll_once().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    let f = fixture(4, 1).await;
    for i in 0..3 {
        f.submit(pending(&format!("0x0{}", i))).await;
    }

    assert_eq!(f.worker.poll_once().await.unwrap(), 3);
    f.worker.drain().await;

    assert_eq!(f.handler.peak.load(Ordering::SeqCst), 1);
    assert_eq!(f.count("Ok"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_are_counted() {
    let f = fixture(1, 4).await;
    let key = f
        .submit(json!({"status": "Pending", "beneficiary": "0x01", "type": "Swap"}))
        .await;

    assert_eq!(f.worker.poll_once().await.unwrap(), 1);
    f.worker.drain().await;

    assert_eq!(f.status(&key).await, "Failed");
    assert_eq!(f.count("InvalidRequestError"), 1);
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_picks_up_requests_until_shutdown() {
    let f = fixture(1, 4).await;
    let early = f.submit(pending("0x01")).await;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = f.worker.clone();
    let running = tokio::spawn(async move {
        worker
            .run(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(120)).await;
    let late = f.submit(pending("0x02")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    stop_tx.send(()).unwrap();
    running.await.unwrap();

    assert_eq!(f.status(&early).await, "Done");
    assert_eq!(f.status(&late).await, "Done");
    assert_eq!(f.count("Ok"), 2);
}
