//! Shared building blocks for the drip faucet: the store contract, store
//! addressing, error types and process-level utilities.

pub mod error;
pub mod traits;
pub mod types;
pub mod utils;

pub use error::{StoreError, StoreResult};
pub use traits::LockStore;
pub use types::FieldPath;
