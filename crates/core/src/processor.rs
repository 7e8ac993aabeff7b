//! Drives one funding request through `Pending -> Working -> Done | Failed`.
//!
//! The processor owns the `status` field of request records. The transfer
//! itself is delegated to a [`RequestHandler`] running under an account lease.

use crate::account::AccountRecord;
use crate::pool::{AccountPool, LeaseOutcome, PoolError};
use crate::request::{
    RequestRecord, RequestStatus, RequestType, RESULT_TX_HASH_FIELD, STATUS_FIELD, TOKEN_TX_HASHES_FIELD,
};
use async_trait::async_trait;
use drip_common::error::StoreError;
use drip_common::traits::LockStore;
use drip_common::types::{collection_path, FieldPath, REQUESTS};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Externally reported result of processing one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionResult {
    Ok,
    NoFreeAccountError,
    ActionTimedOutError,
    InvalidRequestError,
    OtherError,
}

impl ExecutionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionResult::Ok => "Ok",
            ExecutionResult::NoFreeAccountError => "NoFreeAccountError",
            ExecutionResult::ActionTimedOutError => "ActionTimedOutError",
            ExecutionResult::InvalidRequestError => "InvalidRequestError",
            ExecutionResult::OtherError => "OtherError",
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction hashes produced by a successful handler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: Option<String>,
    /// Token symbol to transfer hash
    pub token_tx_hashes: BTreeMap<String, String>,
}

/// The work done for a request while an account is leased.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &RequestRecord, account: &AccountRecord) -> anyhow::Result<TransferReceipt>;
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Request {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Request {key}: {source}")]
    Pool {
        key: String,
        #[source]
        source: PoolError,
    },
}

impl ProcessError {
    pub fn key(&self) -> &str {
        match self {
            ProcessError::Store { key, .. } | ProcessError::Pool { key, .. } => key,
        }
    }
}

pub struct RequestProcessor {
    store: Arc<dyn LockStore>,
    pool: Arc<AccountPool>,
    handler: Arc<dyn RequestHandler>,
    network: String,
}

impl RequestProcessor {
    pub fn new(
        store: Arc<dyn LockStore>,
        pool: Arc<AccountPool>,
        handler: Arc<dyn RequestHandler>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pool,
            handler,
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn requests_collection(&self) -> String {
        collection_path(&self.network, REQUESTS)
    }

    /// Reads the stored record under `key` and processes it.
    ///
    /// `Ok(None)` means nothing was done: the record is gone or is no longer `Pending`.
    pub async fn process_key(&self, key: &str) -> Result<Option<ExecutionResult>, ProcessError> {
        let snapshot = self
            .store
            .read_record(&self.requests_collection(), key)
            .await
            .map_err(|source| ProcessError::Store {
                key: key.to_string(),
                source,
            })?;
        match snapshot {
            Some(value) => self.process_snapshot(key, value).await,
            None => {
                debug!(request = key, "Request vanished before processing");
                Ok(None)
            }
        }
    }

    /// Processes a raw record as delivered by the store.
    ///
    /// Only the status is checked before parsing, so an unparseable record that
    /// already left `Pending` is not touched again.
    pub async fn process_snapshot(&self, key: &str, snapshot: Value) -> Result<Option<ExecutionResult>, ProcessError> {
        if snapshot.get(STATUS_FIELD).and_then(Value::as_str) != Some(RequestStatus::Pending.as_str()) {
            debug!(request = key, "Skipping request that is not pending");
            return Ok(None);
        }

        match serde_json::from_value::<RequestRecord>(snapshot) {
            Ok(record) => self.process_request(key, record).await,
            Err(e) => self.reject(key, &e.to_string()).await,
        }
    }

    /// Processes a parsed request. Re-delivery of a request that already left
    /// `Pending` is a no-op, and of concurrent deliveries only the one that
    /// moves the stored record out of `Pending` goes on.
    ///
    /// A store or pool failure marks the record `Failed`, is logged as
    /// `OtherError`, and is returned to the caller.
    pub async fn process_request(
        &self,
        key: &str,
        record: RequestRecord,
    ) -> Result<Option<ExecutionResult>, ProcessError> {
        if record.status != RequestStatus::Pending {
            debug!(request = key, status = record.status.as_str(), "Skipping request that is not pending");
            return Ok(None);
        }
        if record.kind == RequestType::Unknown {
            return self.reject(key, "unsupported request type").await;
        }
        if !self.claim(key, RequestStatus::Working).await? {
            return Ok(None);
        }

        match self.execute(key, &record).await {
            Ok(result) => {
                self.log_execution_result(key, result);
                Ok(Some(result))
            }
            Err(e) => {
                if let Err(mark_err) = self.set_status(key, RequestStatus::Failed).await {
                    error!(request = key, "Failed to mark request as failed: {}", mark_err);
                }
                error!(request = key, network = %self.network, "Request processing failed: {}", e);
                self.log_execution_result(key, ExecutionResult::OtherError);
                Err(e)
            }
        }
    }

    async fn execute(&self, key: &str, record: &RequestRecord) -> Result<ExecutionResult, ProcessError> {
        let handler = self.handler.clone();
        let request = record.clone();
        let outcome = self
            .pool
            .lease_and_run(move |account| async move { handler.handle(&request, &account).await })
            .await
            .map_err(|source| ProcessError::Pool {
                key: key.to_string(),
                source,
            })?;

        match outcome {
            LeaseOutcome::Completed(receipt) => {
                self.complete(key, receipt).await?;
                Ok(ExecutionResult::Ok)
            }
            LeaseOutcome::NoFreeAccount => {
                self.set_status(key, RequestStatus::Failed).await?;
                Ok(ExecutionResult::NoFreeAccountError)
            }
            LeaseOutcome::ActionTimeout => {
                self.set_status(key, RequestStatus::Failed).await?;
                Ok(ExecutionResult::ActionTimedOutError)
            }
        }
    }

    async fn complete(&self, key: &str, receipt: TransferReceipt) -> Result<(), ProcessError> {
        let mut fields = Map::new();
        fields.insert(STATUS_FIELD.to_string(), Value::from(RequestStatus::Done.as_str()));
        if let Some(hash) = receipt.tx_hash {
            fields.insert(RESULT_TX_HASH_FIELD.to_string(), Value::String(hash));
        }
        if !receipt.token_tx_hashes.is_empty() {
            let hashes = receipt
                .token_tx_hashes
                .into_iter()
                .map(|(symbol, hash)| (symbol, Value::String(hash)))
                .collect::<Map<_, _>>();
            fields.insert(TOKEN_TX_HASHES_FIELD.to_string(), Value::Object(hashes));
        }

        self.store
            .update_record(&self.requests_collection(), key, fields)
            .await
            .map_err(|source| ProcessError::Store {
                key: key.to_string(),
                source,
            })
    }

    async fn reject(&self, key: &str, reason: &str) -> Result<Option<ExecutionResult>, ProcessError> {
        if !self.claim(key, RequestStatus::Failed).await? {
            return Ok(None);
        }
        warn!(request = key, network = %self.network, "Invalid request: {}", reason);
        let result = ExecutionResult::InvalidRequestError;
        self.log_execution_result(key, result);
        Ok(Some(result))
    }

    /// Moves the stored record from `Pending` to `status`. False when another
    /// delivery got there first.
    async fn claim(&self, key: &str, status: RequestStatus) -> Result<bool, ProcessError> {
        let path = FieldPath::new(self.requests_collection(), key, STATUS_FIELD);
        let claimed = self
            .store
            .compare_and_set(
                &path,
                &Value::from(RequestStatus::Pending.as_str()),
                Value::from(status.as_str()),
            )
            .await
            .map_err(|source| ProcessError::Store {
                key: key.to_string(),
                source,
            })?;
        if !claimed {
            debug!(request = key, "Request already claimed by another delivery");
        }
        Ok(claimed)
    }

    async fn set_status(&self, key: &str, status: RequestStatus) -> Result<(), ProcessError> {
        let path = FieldPath::new(self.requests_collection(), key, STATUS_FIELD);
        self.store
            .write_field(&path, Value::from(status.as_str()))
            .await
            .map_err(|source| ProcessError::Store {
                key: key.to_string(),
                source,
            })
    }

    fn log_execution_result(&self, key: &str, result: ExecutionResult) {
        info!(request = key, network = %self.network, result = result.as_str(), "Execution result: {}", result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_names() {
        assert_eq!(ExecutionResult::Ok.to_string(), "Ok");
        assert_eq!(ExecutionResult::NoFreeAccountError.to_string(), "NoFreeAccountError");
        assert_eq!(ExecutionResult::ActionTimedOutError.to_string(), "ActionTimedOutError");
        assert_eq!(ExecutionResult::InvalidRequestError.to_string(), "InvalidRequestError");
        assert_eq!(ExecutionResult::OtherError.to_string(), "OtherError");
    }

    #[test]
    fn test_process_error_keeps_key() {
        let err = ProcessError::Store {
            key: "0001".to_string(),
            source: StoreError::Backend("down".to_string()),
        };
        assert_eq!(err.key(), "0001");
        assert!(err.to_string().contains("down"));
    }
}
