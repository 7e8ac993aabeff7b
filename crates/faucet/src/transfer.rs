//! Transfer handler run under an account lease.
//!
//! Builds legacy EIP-155 transactions, signs them with the leased account's
//! key and submits them through the network's node. The account is leased
//! exclusively, so its pending nonce cannot be raced by another handler.

use crate::config::{NetworkConfig, SendAmounts};
use crate::error::{FaucetError, FaucetResult};
use crate::rpc::RpcClient;
use async_trait::async_trait;
use drip_core::{AccountRecord, Credential, RequestHandler, RequestRecord, RequestedTokens, TransferReceipt};
use ethabi::ethereum_types::{Address, U256};
use ethabi::{ParamType, Token};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rlp::RlpStream;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Attempts for the native transfer
pub const NATIVE_TRANSFER_ATTEMPTS: usize = 3;

/// Pause between native transfer attempts
pub const NATIVE_TRANSFER_RETRY_WAIT: Duration = Duration::from_millis(500);

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn signing_key_from_credential(credential: &Credential) -> FaucetResult<SigningKey> {
    let secret = credential.expose();
    let bytes = hex::decode(secret.strip_prefix("0x").unwrap_or(secret))
        .map_err(|e| FaucetError::InvalidKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(FaucetError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())));
    }
    SigningKey::from_slice(&bytes).map_err(|e| FaucetError::InvalidKey(e.to_string()))
}

/// Last 20 bytes of the keccak hash of the uncompressed public key
pub fn address_from_key(key: &SigningKey) -> Address {
    let public_key = key.verifying_key().to_encoded_point(false);
    let hash = keccak_hash::keccak(&public_key.as_bytes()[1..]);
    Address::from_slice(&hash.as_bytes()[12..])
}

pub fn address_from_credential(credential: &Credential) -> FaucetResult<String> {
    let key = signing_key_from_credential(credential)?;
    Ok(format_address(&address_from_key(&key)))
}

pub fn parse_address(address: &str) -> FaucetResult<Address> {
    let digits = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(digits).map_err(|_| FaucetError::InvalidAddress(address.to_string()))?;
    if bytes.len() != 20 {
        return Err(FaucetError::InvalidAddress(address.to_string()));
    }
    Ok(Address::from_slice(&bytes))
}

pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

/// Decimal wei string
pub fn parse_amount(amount: &str) -> FaucetResult<U256> {
    U256::from_dec_str(amount.trim()).map_err(|_| FaucetError::InvalidAmount(amount.to_string()))
}

fn trimmed_bytes(value: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let start = buf.iter().position(|b| *b != 0).unwrap_or(buf.len());
    buf[start..].to_vec()
}

/// Calldata of ERC-20 `transfer(address,uint256)`
pub fn erc20_transfer_data(to: Address, amount: U256) -> Vec<u8> {
    let mut data = ethabi::short_signature("transfer", &[ParamType::Address, ParamType::Uint(256)]).to_vec();
    data.extend(ethabi::encode(&[Token::Address(to), Token::Uint(amount)]));
    data
}

/// Pre-EIP-2718 transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    fn append_fields(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&trimmed_bytes(self.gas_price));
        stream.append(&self.gas_limit);
        stream.append(&self.to.as_bytes().to_vec());
        stream.append(&trimmed_bytes(self.value));
        stream.append(&self.data);
    }

    /// EIP-155 hash: the six fields followed by `chain_id, 0, 0`
    pub fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        self.append_fields(&mut stream);
        stream.append(&chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak_hash::keccak(stream.out()).0
    }

    /// Raw signed transaction, ready for `eth_sendRawTransaction`
    pub fn sign(&self, key: &SigningKey, chain_id: u64) -> FaucetResult<Vec<u8>> {
        let hash = self.signing_hash(chain_id);
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| FaucetError::TransactionFailed(format!("Signing failed: {}", e)))?;

        let v = chain_id * 2 + 35 + u64::from(recovery_id.to_byte());
        let bytes = signature.to_bytes();
        let (r, s) = bytes.split_at(32);

        let mut stream = RlpStream::new();
        stream.begin_list(9);
        self.append_fields(&mut stream);
        stream.append(&v);
        stream.append(&trim_leading_zeros(r).to_vec());
        stream.append(&trim_leading_zeros(s).to_vec());
        Ok(stream.out().to_vec())
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Runs `operation` up to `attempts` times, sleeping `wait` between failures.
pub async fn retry_async<F, Fut, T, E>(attempts: usize, wait: Duration, mut operation: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("Attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sends the faucet amounts of one network
pub struct FaucetHandler {
    network: String,
    config: NetworkConfig,
    rpc: RpcClient,
}

impl FaucetHandler {
    pub fn new(network: impl Into<String>, config: NetworkConfig) -> Self {
        let rpc = RpcClient::new(config.node_url.clone());
        Self {
            network: network.into(),
            config,
            rpc,
        }
    }

    async fn send_transaction(
        &self,
        key: &SigningKey,
        from: &str,
        to: Address,
        value: U256,
        data: Vec<u8>,
        gas_limit: u64,
    ) -> FaucetResult<String> {
        let nonce = self.rpc.get_transaction_count(from).await?;
        let chain_id = match self.config.chain_id {
            Some(id) => id,
            None => self.rpc.chain_id().await?,
        };
        let gas_price = match &self.config.gas_price {
            Some(price) => parse_amount(price)?,
            None => self.rpc.gas_price().await?,
        };

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
        };
        let raw = tx.sign(key, chain_id)?;
        let tx_hash = self.rpc.send_raw_transaction(&raw).await?;

        if self.config.wait_for_receipt {
            self.wait_for_receipt(&tx_hash).await?;
        }
        Ok(tx_hash)
    }

    /// Polls until mined. The surrounding lease deadline bounds the wait.
    async fn wait_for_receipt(&self, tx_hash: &str) -> FaucetResult<()> {
        loop {
            if let Some(receipt) = self.rpc.get_transaction_receipt(tx_hash).await? {
                if receipt.get("status").and_then(|s| s.as_str()) == Some("0x0") {
                    return Err(FaucetError::TransactionFailed(format!("{} reverted", tx_hash)));
                }
                return Ok(());
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    /// Sends the native amount and every configured stable token to `beneficiary`.
    ///
    /// The native transfer is retried and its failure fails the whole call. A
    /// failed stable token transfer is logged and left out of the receipt.
    pub async fn send_funds(
        &self,
        account: &AccountRecord,
        beneficiary: &str,
        amounts: &SendAmounts,
        tokens: RequestedTokens,
    ) -> anyhow::Result<TransferReceipt> {
        let key = signing_key_from_credential(&account.credential)?;
        let from = format_address(&address_from_key(&key));
        let to = parse_address(beneficiary)?;
        let mut receipt = TransferReceipt::default();

        if tokens.includes_native() {
            let value = parse_amount(&amounts.native)?;
            if value.is_zero() {
                info!(network = %self.network, "Native transfer to {} skipped, amount is zero", beneficiary);
            } else {
                info!(
                    network = %self.network,
                    account = %from,
                    "Sending {} wei to {}",
                    value,
                    beneficiary
                );
                let tx_hash = retry_async(NATIVE_TRANSFER_ATTEMPTS, NATIVE_TRANSFER_RETRY_WAIT, |_| {
                    self.send_transaction(&key, &from, to, value, Vec::new(), self.config.gas_limit)
                })
                .await?;
                info!(network = %self.network, "Native transfer sent: {}", tx_hash);
                receipt.tx_hash = Some(tx_hash);
            }
        }

        if tokens.includes_stables() {
            let amount = parse_amount(&amounts.stable)?;
            for token in &self.config.stable_tokens {
                let result = match parse_address(&token.address) {
                    Ok(contract) => {
                        self.send_transaction(
                            &key,
                            &from,
                            contract,
                            U256::zero(),
                            erc20_transfer_data(to, amount),
                            self.config.token_gas_limit,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                match result {
                    Ok(tx_hash) => {
                        info!(network = %self.network, "{} transfer sent: {}", token.symbol, tx_hash);
                        receipt.token_tx_hashes.insert(token.symbol.clone(), tx_hash);
                    }
                    Err(e) => warn!(network = %self.network, "{} transfer to {} failed: {}", token.symbol, beneficiary, e),
                }
            }
        }

        Ok(receipt)
    }
}

#[async_trait]
impl RequestHandler for FaucetHandler {
    async fn handle(&self, request: &RequestRecord, account: &AccountRecord) -> anyhow::Result<TransferReceipt> {
        let amounts = self.config.amounts_for(request.auth_level);
        self.send_funds(account, &request.beneficiary, &amounts, request.tokens)
            .await
    }
}
