//! JSON-RPC client for a network's node

use crate::error::{FaucetError, FaucetResult};
use ethabi::ethereum_types::U256;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Minimal Ethereum JSON-RPC client
pub struct RpcClient {
    node_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    pub async fn call(&self, method: &str, params: Value) -> FaucetResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });
        debug!("RPC {} -> {}", method, self.node_url);

        let response = self
            .client
            .post(&self.node_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Request failed: {}", e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Invalid response: {}", e)))?;

        if let Some(error) = body.get("error") {
            return Err(FaucetError::RpcError(format!("{} failed: {}", method, error)));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Next nonce of `address`, counting transactions still in the pool.
    pub async fn get_transaction_count(&self, address: &str) -> FaucetResult<u64> {
        let result = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_u64(&result)
    }

    pub async fn chain_id(&self) -> FaucetResult<u64> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_u64(&result)
    }

    pub async fn gas_price(&self) -> FaucetResult<U256> {
        let result = self.call("eth_gasPrice", json!([])).await?;
        parse_u256(&result)
    }

    /// Submits a signed transaction and returns its hash.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> FaucetResult<String> {
        let result = self
            .call("eth_sendRawTransaction", json!([format!("0x{}", hex::encode(raw))]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FaucetError::RpcError(format!("Unexpected transaction hash: {}", result)))
    }

    /// `None` until the transaction is mined.
    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> FaucetResult<Option<Value>> {
        let result = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}

fn quantity(value: &Value) -> FaucetResult<&str> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .ok_or_else(|| FaucetError::RpcError(format!("Expected hex quantity, got {}", value)))
}

pub(crate) fn parse_u64(value: &Value) -> FaucetResult<u64> {
    let digits = quantity(value)?;
    u64::from_str_radix(digits, 16).map_err(|e| FaucetError::RpcError(format!("Bad quantity {}: {}", value, e)))
}

pub(crate) fn parse_u256(value: &Value) -> FaucetResult<U256> {
    let digits = quantity(value)?;
    U256::from_str_radix(digits, 16).map_err(|e| FaucetError::RpcError(format!("Bad quantity {}: {:?}", value, e)))
}
