//! Exclusive leasing of shared signing accounts.
//!
//! A lease attempt moves `Searching -> Locked | Exhausted`. Searching scans the
//! account collection in listing order, takes the first account whose
//! compare-and-set on `locked` commits, and rescans after `retry_wait` until
//! `get_account_timeout` has passed. Store calls never outlive that deadline. A locked account then runs the action
//! under `action_timeout` and is always released afterwards with a plain
//! write of `locked = false`.
//!
//! Scan order is first-fit over the store's insertion order. There is no
//! fairness between waiters and accounts late in the list can starve under
//! sustained contention.

use crate::account::{AccountRecord, LOCKED_FIELD};
use crate::timeout::run_with_timeout_or_else;
use drip_common::error::{StoreError, StoreResult};
use drip_common::traits::LockStore;
use drip_common::types::{collection_path, is_truthy, FieldPath, ACCOUNTS};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

const SECOND_MS: u64 = 1000;

/// What happens to an action still running when its deadline fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTimeoutPolicy {
    /// Drop the action future. It stops at its next suspension point and the
    /// lease is released only after that.
    #[default]
    Cancel,
    /// Run the action as a spawned task and stop waiting for it. The task keeps
    /// running unsupervised after the lease is released, so it can still touch
    /// the account (and external state) while another action holds the lease.
    Detach,
}

/// Timing of one pool instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Pause between full scans that found no free account
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Total time allowed to find and lock a free account
    #[serde(default = "default_get_account_timeout_ms")]
    pub get_account_timeout_ms: u64,

    /// Total time the caller waits for the leased action
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default)]
    pub on_action_timeout: ActionTimeoutPolicy,
}

fn default_retry_wait_ms() -> u64 { SECOND_MS }
fn default_get_account_timeout_ms() -> u64 { 20 * SECOND_MS }
fn default_action_timeout_ms() -> u64 { 90 * SECOND_MS }

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            retry_wait_ms: default_retry_wait_ms(),
            get_account_timeout_ms: default_get_account_timeout_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            on_action_timeout: ActionTimeoutPolicy::default(),
        }
    }
}

impl PoolOptions {
    pub fn new(retry_wait_ms: u64, get_account_timeout_ms: u64, action_timeout_ms: u64) -> Self {
        Self {
            retry_wait_ms,
            get_account_timeout_ms,
            action_timeout_ms,
            on_action_timeout: ActionTimeoutPolicy::default(),
        }
    }

    pub fn with_action_timeout_policy(mut self, policy: ActionTimeoutPolicy) -> Self {
        self.on_action_timeout = policy;
        self
    }

    /// Never zero, so a retry always yields to the timer.
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms.max(1))
    }

    pub fn get_account_timeout(&self) -> Duration {
        Duration::from_millis(self.get_account_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Pool-level outcome code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeCode {
    Ok,
    NoFreeAccount,
    ActionTimeout,
}

/// Result of [`AccountPool::lease_and_run`] when nothing failed outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    /// The action finished before its deadline with this value
    Completed(T),
    /// Every account stayed locked for the whole acquire deadline; the action never ran
    NoFreeAccount,
    /// The action was still running when its deadline fired
    ActionTimeout,
}

impl<T> LeaseOutcome<T> {
    pub fn code(&self) -> OutcomeCode {
        match self {
            LeaseOutcome::Completed(_) => OutcomeCode::Ok,
            LeaseOutcome::NoFreeAccount => OutcomeCode::NoFreeAccount,
            LeaseOutcome::ActionTimeout => OutcomeCode::ActionTimeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid account {key}: {reason}")]
    InvalidAccount { key: String, reason: String },

    #[error("Action failed: {0:#}")]
    Action(anyhow::Error),

    #[error("Action panicked: {0}")]
    ActionPanicked(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Exclusive hold on one account, released exactly once.
///
/// Dropping a lease that was not released (the holder was itself cancelled or
/// panicked) schedules the release on the current runtime.
pub struct Lease {
    store: Arc<dyn LockStore>,
    path: FieldPath,
    account: AccountRecord,
    released: bool,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.path.key
    }

    pub fn account(&self) -> &AccountRecord {
        &self.account
    }

    async fn release(mut self) -> Result<(), StoreError> {
        let result = self.store.write_field(&self.path, Value::Bool(false)).await;
        self.released = true;
        if result.is_ok() {
            debug!(account = %self.account.address, "Released account {}", self.path.key);
        }
        result
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Lease on {} dropped unreleased, releasing in background", path);
                handle.spawn(release_in_background(store, path));
            }
            Err(_) => error!("Lease on {} dropped outside a runtime, lock stays set", path),
        }
    }
}

/// Compare-and-set on one account's `locked` field, running as its own task.
///
/// Dropped before it settled (acquire deadline, or the caller went away), the
/// attempt is left to finish and a commit is undone in the background.
struct LockAttempt {
    store: Arc<dyn LockStore>,
    path: FieldPath,
    handle: Option<JoinHandle<StoreResult<bool>>>,
}

impl LockAttempt {
    fn start(store: Arc<dyn LockStore>, path: FieldPath) -> Self {
        let task_store = store.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move { task_store.compare_and_set_true(&task_path).await });
        Self {
            store,
            path,
            handle: Some(handle),
        }
    }

    /// `None` when `deadline` passed first.
    async fn settle(mut self, deadline: Instant) -> Option<Result<StoreResult<bool>, JoinError>> {
        let handle = self.handle.as_mut()?;
        let joined = timeout_at(deadline, handle).await.ok()?;
        self.handle = None;
        Some(joined)
    }
}

impl Drop for LockAttempt {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let store = self.store.clone();
        let path = self.path.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Ok(Ok(true)) = handle.await {
                    warn!("Lock on {} committed after its attempt was abandoned", path);
                    release_in_background(store, path).await;
                }
            });
        }
    }
}

/// Pool of shared signing accounts under `<namespace>/accounts`
pub struct AccountPool {
    store: Arc<dyn LockStore>,
    namespace: String,
    options: PoolOptions,
}

impl AccountPool {
    pub fn new(store: Arc<dyn LockStore>, namespace: impl Into<String>, options: PoolOptions) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            options,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn accounts_collection(&self) -> String {
        collection_path(&self.namespace, ACCOUNTS)
    }

    /// Adds one account and returns its key.
    pub async fn add_account(&self, account: &AccountRecord) -> PoolResult<String> {
        let value = serde_json::to_value(account).map_err(StoreError::from)?;
        let key = self.store.push(&self.accounts_collection(), value).await?;
        info!(account = %account.address, "Added account {} to {}", key, self.namespace);
        Ok(key)
    }

    /// Removes every account of this pool, leased or not.
    pub async fn remove_all(&self) -> PoolResult<usize> {
        let removed = self.store.remove_collection(&self.accounts_collection()).await?;
        info!("Removed {} accounts from {}", removed, self.namespace);
        Ok(removed)
    }

    /// Snapshot of every account, without locking.
    pub async fn get_accounts(&self) -> PoolResult<Vec<(String, AccountRecord)>> {
        let collection = self.accounts_collection();
        let records = self.store.read_collection(&collection).await?;
        records
            .into_iter()
            .map(|(key, value)| {
                let account = parse_account(&key, value)?;
                Ok((key, account))
            })
            .collect()
    }

    /// Leases a free account, runs `action` with it and releases it.
    ///
    /// Returns `NoFreeAccount` without running the action when no account could
    /// be locked within `get_account_timeout`, and `ActionTimeout` when the
    /// action outlived `action_timeout`. An action error or panic surfaces as
    /// `Err` once the lease has been released. A failed release is logged and
    /// does not replace the action's outcome.
    pub async fn lease_and_run<F, Fut, T>(&self, action: F) -> PoolResult<LeaseOutcome<T>>
    where
        F: FnOnce(AccountRecord) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(lease) = self.acquire().await? else {
            return Ok(LeaseOutcome::NoFreeAccount);
        };

        let outcome = self.run_leased(lease.account().clone(), action).await;

        let key = lease.key().to_string();
        if let Err(e) = lease.release().await {
            error!("Failed to release account {} in {}: {}", key, self.namespace, e);
        }
        outcome
    }

    async fn run_leased<F, Fut, T>(&self, account: AccountRecord, action: F) -> PoolResult<LeaseOutcome<T>>
    where
        F: FnOnce(AccountRecord) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = self.options.action_timeout();
        let address = account.address.clone();
        let on_timeout = || async {
            warn!(account = %address, "Action timed out after {:?}", deadline);
            Ok(LeaseOutcome::ActionTimeout)
        };

        match self.options.on_action_timeout {
            ActionTimeoutPolicy::Cancel => {
                let running = AssertUnwindSafe(action(account)).catch_unwind();
                run_with_timeout_or_else(
                    deadline,
                    async move {
                        match running.await {
                            Ok(Ok(value)) => Ok(LeaseOutcome::Completed(value)),
                            Ok(Err(e)) => Err(PoolError::Action(e)),
                            Err(panic) => Err(PoolError::ActionPanicked(panic_message(panic))),
                        }
                    },
                    on_timeout,
                )
                .await
            }
            ActionTimeoutPolicy::Detach => {
                let handle = tokio::spawn(action(account));
                run_with_timeout_or_else(
                    deadline,
                    async move {
                        match handle.await {
                            Ok(Ok(value)) => Ok(LeaseOutcome::Completed(value)),
                            Ok(Err(e)) => Err(PoolError::Action(e)),
                            Err(join) => Err(PoolError::ActionPanicked(join.to_string())),
                        }
                    },
                    on_timeout,
                )
                .await
            }
        }
    }

    /// Scans and retries until an account is locked or the deadline has passed.
    ///
    /// Every store call of a pass is cut off at the deadline. A lock attempt
    /// cut off that way is undone once it commits (see [`LockAttempt`]).
    async fn acquire(&self) -> PoolResult<Option<Lease>> {
        let started = Instant::now();
        let deadline = started + self.options.get_account_timeout();
        let mut retries = 0u32;

        loop {
            if let Some(lease) = self.try_lock_account(deadline).await? {
                info!(
                    account = %lease.account().address,
                    "LockAccount: {} (after {} retries)",
                    lease.account().address,
                    retries
                );
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "LockAccount: Failed in {} after {} retries ({:?})",
                    self.namespace,
                    retries,
                    now - started
                );
                return Ok(None);
            }

            tokio::time::sleep(self.options.retry_wait().min(deadline - now)).await;
            retries += 1;
        }
    }

    /// One first-fit pass over a fresh listing of the accounts, abandoned at `deadline`.
    async fn try_lock_account(&self, deadline: Instant) -> PoolResult<Option<Lease>> {
        let collection = self.accounts_collection();
        let Ok(keys) = timeout_at(deadline, self.store.list_children(&collection)).await else {
            return Ok(None);
        };

        for key in keys? {
            let path = FieldPath::new(&collection, &key, LOCKED_FIELD);
            let Ok(locked) = timeout_at(deadline, self.store.read_field(&path)).await else {
                return Ok(None);
            };
            if is_truthy(locked?.as_ref()) {
                continue;
            }

            let attempt = LockAttempt::start(self.store.clone(), path.clone());
            let Some(joined) = attempt.settle(deadline).await else {
                return Ok(None);
            };
            let committed = joined.map_err(|e| StoreError::Backend(format!("lock attempt failed: {}", e)))?;
            match committed {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Lost lock race for {}", path);
                    continue;
                }
                Err(e @ StoreError::InvalidRecord { .. }) => {
                    error!("Skipping unusable account {}: {}", key, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let loaded = match timeout_at(deadline, self.load_account(&collection, &key)).await {
                Ok(loaded) => loaded,
                Err(_) => {
                    spawn_release(self.store.clone(), path);
                    return Ok(None);
                }
            };
            match loaded {
                Ok(Some(account)) => {
                    return Ok(Some(Lease {
                        store: self.store.clone(),
                        path,
                        account,
                        released: false,
                    }))
                }
                Ok(None) => {
                    debug!("Account {} vanished after locking", path);
                }
                Err(e) => {
                    error!("Skipping unusable account {}: {}", key, e);
                    if let Err(e) = self.store.write_field(&path, Value::Bool(false)).await {
                        error!("Failed to unlock unusable account {}: {}", key, e);
                    }
                }
            }
        }

        Ok(None)
    }

    async fn load_account(&self, collection: &str, key: &str) -> PoolResult<Option<AccountRecord>> {
        let Some(value) = self.store.read_record(collection, key).await? else {
            return Ok(None);
        };
        parse_account(key, value).map(Some)
    }
}

fn spawn_release(store: Arc<dyn LockStore>, path: FieldPath) {
    warn!("Lock on {} taken too late, releasing in background", path);
    tokio::spawn(release_in_background(store, path));
}

async fn release_in_background(store: Arc<dyn LockStore>, path: FieldPath) {
    if let Err(e) = store.write_field(&path, Value::Bool(false)).await {
        error!("Background release of {} failed: {}", path, e);
    }
}

fn parse_account(key: &str, value: Value) -> PoolResult<AccountRecord> {
    serde_json::from_value(value).map_err(|e| PoolError::InvalidAccount {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
