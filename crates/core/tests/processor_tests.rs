//! Request lifecycle scenarios against an in-memory store.

use async_trait::async_trait;
use drip_common::traits::LockStore;
use drip_common::types::FieldPath;
use drip_common::utils::logging::init_test_logging;
use drip_core::{
    AccountPool, AccountRecord, Credential, ExecutionResult, PoolError, PoolOptions, ProcessError,
    RequestHandler, RequestProcessor, RequestRecord, RequestStatus, TransferReceipt,
};
use drip_storage::MemoryStore;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const NETWORK: &str = "alfajores";

/// Handler that records its calls and the request status it saw.
struct MockHandler {
    store: Arc<MemoryStore>,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl MockHandler {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for MockHandler {
    async fn handle(&self, request: &RequestRecord, account: &AccountRecord) -> anyhow::Result<TransferReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(account.credential.expose(), "0x01");

        // The pending snapshot is handed over, while the store already says Working.
        assert_eq!(request.status, RequestStatus::Pending);
        let stored = self
            .store
            .list_children(&format!("{}/requests", NETWORK))
            .await?;
        for key in stored {
            let path = FieldPath::new(format!("{}/requests", NETWORK), key, "status");
            assert_eq!(self.store.read_field(&path).await?, Some(json!("Working")));
        }

        tokio::time::sleep(self.delay).await;
        if self.fail {
            anyhow::bail!("node rejected transaction");
        }

        let mut token_tx_hashes = BTreeMap::new();
        token_tx_hashes.insert("cUSD".to_string(), "0xtoken".to_string());
        Ok(TransferReceipt {
            tx_hash: Some(format!("0xhash-{}", request.beneficiary)),
            token_tx_hashes,
        })
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    pool: Arc<AccountPool>,
    handler: Arc<MockHandler>,
    processor: RequestProcessor,
}

impl Fixture {
    async fn new(options: PoolOptions, handler: impl FnOnce(MockHandler) -> MockHandler) -> Self {
        init_test_logging();
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(AccountPool::new(store.clone(), NETWORK, options));
        pool.add_account(&AccountRecord::new(Credential::new("0x01"), "0xsender"))
            .await
            .unwrap();
        let handler = Arc::new(handler(MockHandler::new(store.clone())));
        let processor = RequestProcessor::new(store.clone(), pool.clone(), handler.clone(), NETWORK);
        Self {
            store,
            pool,
            handler,
            processor,
        }
    }

    async fn submit(&self, record: Value) -> String {
        self.store
            .push(&self.processor.requests_collection(), record)
            .await
            .unwrap()
    }

    async fn record(&self, key: &str) -> Value {
        self.store
            .read_record(&self.processor.requests_collection(), key)
            .await
            .unwrap()
            .unwrap()
    }

    async fn lock_all_accounts(&self) {
        for (key, _) in self.pool.get_accounts().await.unwrap() {
            let path = FieldPath::new(self.pool.accounts_collection(), key, "locked");
            self.store.write_field(&path, Value::Bool(true)).await.unwrap();
        }
    }

    async fn account_locked(&self) -> bool {
        self.pool.get_accounts().await.unwrap()[0].1.locked
    }
}

fn pending(beneficiary: &str) -> Value {
    json!({"status": "Pending", "beneficiary": beneficiary, "type": "Faucet"})
}

#[tokio::test(start_paused = true)]
async fn test_single_account_request_completes() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    let key = fixture.submit(pending("0xabc")).await;

    let result = fixture.processor.process_key(&key).await.unwrap();

    assert_eq!(result, Some(ExecutionResult::Ok));
    let record = fixture.record(&key).await;
    assert_eq!(record["status"], "Done");
    assert_eq!(record["resultTxHash"], "0xhash-0xabc");
    assert_eq!(record["tokenTxHashes"], json!({"cUSD": "0xtoken"}));
    assert!(!fixture.account_locked().await);
    assert_eq!(fixture.handler.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_locked_pool_fails_request() {
    let fixture = Fixture::new(PoolOptions::new(50, 100, 1_000), |h| h).await;
    fixture.lock_all_accounts().await;
    let key = fixture.submit(pending("0xabc")).await;

    let started = Instant::now();
    let result = fixture.processor.process_key(&key).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result, Some(ExecutionResult::NoFreeAccountError));
    assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(150), "{:?}", elapsed);
    assert_eq!(fixture.record(&key).await["status"], "Failed");
    assert_eq!(fixture.handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_delivery_is_a_no_op() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    let key = fixture.submit(pending("0xabc")).await;

    assert_eq!(fixture.processor.process_key(&key).await.unwrap(), Some(ExecutionResult::Ok));
    assert_eq!(fixture.processor.process_key(&key).await.unwrap(), None);
    assert_eq!(fixture.handler.calls(), 1);
    assert_eq!(fixture.record(&key).await["status"], "Done");
}

#[tokio::test(start_paused = true)]
async fn test_non_pending_records_are_skipped() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;

    for status in [RequestStatus::Working, RequestStatus::Done, RequestStatus::Failed] {
        let mut record = RequestRecord::faucet("0xabc");
        record.status = status;
        let key = fixture.submit(serde_json::to_value(&record).unwrap()).await;

        assert_eq!(fixture.processor.process_request(&key, record).await.unwrap(), None);
        assert_eq!(fixture.record(&key).await["status"], status.as_str());
    }
    assert_eq!(fixture.handler.calls(), 0);
    assert!(!fixture.account_locked().await);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_fail_without_lease() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;

    let unknown_type = fixture
        .submit(json!({"status": "Pending", "beneficiary": "0xabc", "type": "Swap"}))
        .await;
    let missing_beneficiary = fixture.submit(json!({"status": "Pending", "type": "Faucet"})).await;

    for key in [unknown_type, missing_beneficiary] {
        let result = fixture.processor.process_key(&key).await.unwrap();
        assert_eq!(result, Some(ExecutionResult::InvalidRequestError));
        assert_eq!(fixture.record(&key).await["status"], "Failed");
    }
    assert_eq!(fixture.handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_marks_failed_and_propagates() {
    let fixture = Fixture::new(PoolOptions::default(), |mut h| {
        h.fail = true;
        h
    })
    .await;
    let key = fixture.submit(pending("0xabc")).await;

    let err = fixture.processor.process_key(&key).await.unwrap_err();

    assert_eq!(err.key(), key);
    match err {
        ProcessError::Pool {
            source: PoolError::Action(e),
            ..
        } => assert_eq!(e.to_string(), "node rejected transaction"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(fixture.record(&key).await["status"], "Failed");
    assert!(!fixture.account_locked().await);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    let fixture = Fixture::new(PoolOptions::new(50, 1_000, 100), |mut h| {
        h.delay = Duration::from_secs(5);
        h
    })
    .await;
    let key = fixture.submit(pending("0xabc")).await;

    let result = fixture.processor.process_key(&key).await.unwrap();

    assert_eq!(result, Some(ExecutionResult::ActionTimedOutError));
    let record = fixture.record(&key).await;
    assert_eq!(record["status"], "Failed");
    assert!(record.get("resultTxHash").is_none());
    assert!(!fixture.account_locked().await);
}

#[tokio::test(start_paused = true)]
async fn test_missing_record_is_ignored() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    assert_eq!(fixture.processor.process_key("ffffffffffffffff").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_non_pending_snapshot_is_left_alone() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    let key = fixture.submit(json!({"status": "Working"})).await;

    let result = fixture
        .processor
        .process_snapshot(&key, json!({"status": "Working"}))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert_eq!(fixture.record(&key).await, json!({"status": "Working"}));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deliveries_run_the_transfer_once() {
    let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(1)));
    let pool = Arc::new(AccountPool::new(store.clone(), NETWORK, PoolOptions::default()));
    for address in ["0xsender1", "0xsender2"] {
        pool.add_account(&AccountRecord::new(Credential::new("0x01"), address))
            .await
            .unwrap();
    }
    let handler = Arc::new(MockHandler::new(store.clone()));
    let processor = RequestProcessor::new(store.clone(), pool.clone(), handler.clone(), NETWORK);
    let key = store
        .push(&processor.requests_collection(), pending("0xabc"))
        .await
        .unwrap();

    let (first, second) = tokio::join!(processor.process_key(&key), processor.process_key(&key));

    let mut results = vec![first.unwrap(), second.unwrap()];
    results.sort_by_key(|r| r.is_some());
    assert_eq!(results, vec![None, Some(ExecutionResult::Ok)]);
    assert_eq!(handler.calls(), 1);
    let record = store
        .read_record(&processor.requests_collection(), &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["status"], "Done");
}

#[tokio::test(start_paused = true)]
async fn test_stale_pending_snapshot_is_not_processed() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    let key = fixture.submit(pending("0xabc")).await;
    let path = FieldPath::new(fixture.processor.requests_collection(), key.clone(), "status");
    fixture.store.write_field(&path, json!("Working")).await.unwrap();

    let result = fixture
        .processor
        .process_snapshot(&key, pending("0xabc"))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert_eq!(fixture.handler.calls(), 0);
    assert_eq!(fixture.record(&key).await["status"], "Working");
    assert!(!fixture.account_locked().await);
}

#[tokio::test(start_paused = true)]
async fn test_stale_invalid_snapshot_is_not_rejected() {
    let fixture = Fixture::new(PoolOptions::default(), |h| h).await;
    let key = fixture
        .submit(json!({"status": "Pending", "beneficiary": "0xabc", "type": "Swap"}))
        .await;
    let path = FieldPath::new(fixture.processor.requests_collection(), key.clone(), "status");
    fixture.store.write_field(&path, json!("Done")).await.unwrap();

    let result = fixture
        .processor
        .process_snapshot(&key, json!({"status": "Pending", "beneficiary": "0xabc", "type": "Swap"}))
        .await
        .unwrap();

    assert_eq!(result, None);
    assert_eq!(fixture.record(&key).await["status"], "Done");
}
