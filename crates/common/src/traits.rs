use crate::error::StoreResult;
use crate::types::FieldPath;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Path-addressable shared store holding account and request records.
///
/// Records are JSON objects stored at `<collection>/<key>`. Every method is a
/// suspension point for callers.
///
/// `compare_and_set_true` and `compare_and_set` must be indivisible for every
/// caller sharing the backend. Account leases and request claims rest on them
/// alone; callers never emulate them with a read followed by a write.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Keys directly under `collection`, in insertion order. Snapshot at call time.
    async fn list_children(&self, collection: &str) -> StoreResult<Vec<String>>;

    /// Point read of a whole record.
    async fn read_record(&self, collection: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Every record under `collection`, in insertion order.
    async fn read_collection(&self, collection: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Point read of one field. `None` when the record or the field is absent.
    async fn read_field(&self, path: &FieldPath) -> StoreResult<Option<Value>>;

    /// Sets the field to `true` unless it is already truthy, atomically.
    ///
    /// Returns whether the write committed. A missing record never commits.
    async fn compare_and_set_true(&self, path: &FieldPath) -> StoreResult<bool>;

    /// Replaces the field with `value` only while it still equals `expected`, atomically.
    ///
    /// Returns whether the write committed. A missing record never commits.
    async fn compare_and_set(&self, path: &FieldPath, expected: &Value, value: Value) -> StoreResult<bool>;

    /// Unconditional overwrite of one field of an existing record.
    async fn write_field(&self, path: &FieldPath, value: Value) -> StoreResult<()>;

    /// Merges `fields` into an existing record.
    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<()>;

    /// Appends a record under a freshly generated key and returns the key.
    async fn push(&self, collection: &str, record: Value) -> StoreResult<String>;

    /// Removes every record under `collection`, returning how many were removed.
    async fn remove_collection(&self, collection: &str) -> StoreResult<usize>;
}
