//! Drip faucet service
//!
//! Funding requests are stored per network, picked up by the request worker
//! and executed by the transfer handler under an exclusively leased signing
//! account. The HTTP API and the CLI only enqueue and inspect requests, apart
//! from the big faucet safe top-up, which leases from the same pool.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod safe;
pub mod transfer;
pub mod worker;

pub use api::{router, AppState};
pub use config::{FaucetConfig, NetworkConfig, SafeFundingConfig, StableToken, WorkerConfig};
pub use error::{FaucetError, FaucetResult};
pub use metrics::FaucetMetrics;
pub use rpc::RpcClient;
pub use safe::fund_safe;
pub use transfer::FaucetHandler;
pub use worker::{build_processors, RequestWorker};
