//! Top-up of a network's big faucet safe.
//!
//! Runs outside the request flow, usually from a scheduler, but leases its
//! signing account from the same pool as requests so it never races them for
//! a nonce.

use crate::config::{FaucetConfig, SendAmounts};
use crate::error::{FaucetError, FaucetResult};
use crate::transfer::{parse_address, FaucetHandler};
use drip_common::traits::LockStore;
use drip_core::{AccountPool, LeaseOutcome, RequestedTokens, TransferReceipt};
use std::sync::Arc;
use tracing::{info, warn};

/// Sends the configured native and stable amounts to the safe of `network`.
pub async fn fund_safe(
    store: Arc<dyn LockStore>,
    config: &FaucetConfig,
    network: &str,
) -> FaucetResult<LeaseOutcome<TransferReceipt>> {
    let network_config = config.get_network(network)?;
    let safe = network_config
        .big_faucet
        .clone()
        .ok_or_else(|| FaucetError::SafeNotConfigured(network.to_string()))?;
    parse_address(&safe.safe_address)?;

    let pool = AccountPool::new(store, config.account_namespace(network)?, safe.pool.clone());
    let handler = Arc::new(FaucetHandler::new(network, network_config.clone()));
    let amounts = SendAmounts {
        native: safe.amount.clone(),
        stable: safe.stables_amount.clone(),
    };

    info!(
        network,
        "Big drip: {} wei + {} of each stable token for {}",
        safe.amount,
        safe.stables_amount,
        safe.safe_address
    );
    let safe_address = safe.safe_address;
    let outcome = pool
        .lease_and_run(move |account| async move {
            handler
                .send_funds(&account, &safe_address, &amounts, RequestedTokens::All)
                .await
        })
        .await?;

    match &outcome {
        LeaseOutcome::Completed(receipt) => info!(network, "Safe funded: {:?}", receipt.tx_hash),
        LeaseOutcome::NoFreeAccount => warn!(network, "Safe not funded, no free account"),
        LeaseOutcome::ActionTimeout => warn!(network, "Safe funding timed out"),
    }
    Ok(outcome)
}
