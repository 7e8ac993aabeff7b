//! Account leasing and request processing for the drip faucet.
//!
//! [`AccountPool`] hands out one of N shared signing accounts per action and
//! guarantees at most one concurrent user per account through the store's
//! compare-and-set. [`RequestProcessor`] drives a funding request through
//! `Pending -> Working -> Done | Failed` around a leased action.

pub mod account;
pub mod pool;
pub mod processor;
pub mod request;
pub mod timeout;

pub use account::{AccountRecord, Credential};
pub use pool::{AccountPool, ActionTimeoutPolicy, Lease, LeaseOutcome, OutcomeCode, PoolError, PoolOptions, PoolResult};
pub use processor::{ExecutionResult, ProcessError, RequestHandler, RequestProcessor, TransferReceipt};
pub use request::{AuthLevel, RequestRecord, RequestStatus, RequestType, RequestedTokens};
pub use timeout::{run_with_timeout, run_with_timeout_or_else, TimeoutError};
