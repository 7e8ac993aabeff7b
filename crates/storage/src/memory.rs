//! In-process store guarded by a single mutex.
//!
//! Compare-and-set is atomic for every task in this process and for no one
//! else: two worker processes each holding a `MemoryStore` share nothing, so
//! account leases are only exclusive within one process.

use async_trait::async_trait;
use drip_common::error::{StoreError, StoreResult};
use drip_common::traits::LockStore;
use drip_common::types::{
    is_truthy, push_key, record_path, validate_collection, validate_segment, FieldPath,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    next_sequence: u64,
}

impl MemoryState {
    fn record(&self, collection: &str, key: &str) -> Option<&Value> {
        self.collections.get(collection).and_then(|c| c.get(key))
    }

    fn record_object_mut(
        &mut self,
        collection: &str,
        key: &str,
    ) -> StoreResult<&mut Map<String, Value>> {
        let path = record_path(collection, key);
        self.collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(key))
            .ok_or_else(|| StoreError::missing_record(&path))?
            .as_object_mut()
            .ok_or_else(|| StoreError::not_an_object(&path))
    }
}

/// Mutex-guarded map of collections, for tests and single-process deployments
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps for `latency` before touching the map, the way a
    /// round-trip to a remote store would suspend the caller.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            latency,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn list_children(&self, collection: &str) -> StoreResult<Vec<String>> {
        validate_collection(collection)?;
        self.round_trip().await;
        let state = self.lock()?;
        Ok(state
            .collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_record(&self, collection: &str, key: &str) -> StoreResult<Option<Value>> {
        validate_collection(collection)?;
        validate_segment(key)?;
        self.round_trip().await;
        let state = self.lock()?;
        Ok(state.record(collection, key).cloned())
    }

    async fn read_collection(&self, collection: &str) -> StoreResult<Vec<(String, Value)>> {
        validate_collection(collection)?;
        self.round_trip().await;
        let state = self.lock()?;
        Ok(state
            .collections
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn read_field(&self, path: &FieldPath) -> StoreResult<Option<Value>> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        self.round_trip().await;
        let state = self.lock()?;
        Ok(state
            .record(&path.collection, &path.key)
            .and_then(|r| r.get(&path.field))
            .cloned())
    }

    async fn compare_and_set_true(&self, path: &FieldPath) -> StoreResult<bool> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        self.round_trip().await;
        let mut state = self.lock()?;
        if state.record(&path.collection, &path.key).is_none() {
            return Ok(false);
        }
        let record = state.record_object_mut(&path.collection, &path.key)?;
        if is_truthy(record.get(&path.field)) {
            trace!("CAS on {} aborted: already set", path);
            return Ok(false);
        }
        record.insert(path.field.clone(), Value::Bool(true));
        trace!("CAS on {} committed", path);
        Ok(true)
    }

    async fn compare_and_set(&self, path: &FieldPath, expected: &Value, value: Value) -> StoreResult<bool> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        validate_segment(&path.field)?;
        self.round_trip().await;
        let mut state = self.lock()?;
        if state.record(&path.collection, &path.key).is_none() {
            return Ok(false);
        }
        let record = state.record_object_mut(&path.collection, &path.key)?;
        if record.get(&path.field) != Some(expected) {
            trace!("CAS on {} aborted: value changed", path);
            return Ok(false);
        }
        record.insert(path.field.clone(), value);
        Ok(true)
    }

    async fn write_field(&self, path: &FieldPath, value: Value) -> StoreResult<()> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        validate_segment(&path.field)?;
        self.round_trip().await;
        let mut state = self.lock()?;
        state
            .record_object_mut(&path.collection, &path.key)?
            .insert(path.field.clone(), value);
        Ok(())
    }

    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<()> {
        validate_collection(collection)?;
        validate_segment(key)?;
        self.round_trip().await;
        let mut state = self.lock()?;
        let record = state.record_object_mut(collection, key)?;
        for (field, value) in fields {
            record.insert(field, value);
        }
        Ok(())
    }

    async fn push(&self, collection: &str, record: Value) -> StoreResult<String> {
        validate_collection(collection)?;
        if !record.is_object() {
            return Err(StoreError::not_an_object(collection));
        }
        self.round_trip().await;
        let mut state = self.lock()?;
        state.next_sequence += 1;
        let key = push_key(state.next_sequence);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.clone(), record);
        Ok(key)
    }

    async fn remove_collection(&self, collection: &str) -> StoreResult<usize> {
        validate_collection(collection)?;
        self.round_trip().await;
        let mut state = self.lock()?;
        Ok(state
            .collections
            .remove(collection)
            .map(|c| c.len())
            .unwrap_or(0))
    }
}
