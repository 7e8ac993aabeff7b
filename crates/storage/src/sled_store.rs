//! Persistent store on a sled tree.
//!
//! Each record is one JSON document under the key `<collection>/<key>`.
//! Field-level writes are read-modify-write cycles closed with sled's
//! `compare_and_swap`, retried when another writer changed the document in
//! between, so concurrent writers to different fields never clobber each
//! other. sled holds an exclusive file lock, which confines the atomicity
//! guarantee to the one process that opened the database.

use async_trait::async_trait;
use drip_common::error::{ErrorContext, StoreError, StoreResult};
use drip_common::traits::LockStore;
use drip_common::types::{
    is_truthy, push_key, record_path, validate_collection, validate_segment, FieldPath,
    PATH_SEPARATOR,
};
use serde_json::{Map, Value};
use sled::{Db, IVec, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

const RECORDS_TREE: &str = "records";

pub struct SledStore {
    db: Db,
    tree: Arc<Tree>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref()).with_context("Failed to open sled database")?;
        debug!("Opened sled store at {}", path.as_ref().display());
        Self::from_db(db)
    }

    /// Wraps an existing `sled::Db`, e.g. a temporary one in tests.
    pub fn from_db(db: Db) -> StoreResult<Self> {
        let tree = db
            .open_tree(RECORDS_TREE)
            .with_context("Failed to open records tree")?;
        Ok(Self {
            db,
            tree: Arc::new(tree),
        })
    }

    /// Flushes dirty pages to disk.
    pub async fn flush(&self) -> StoreResult<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .with_context("Failed to flush sled database")
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tree) -> StoreResult<T> + Send + 'static,
    {
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || f(&tree))
            .await
            .with_context("sled task failed")?
    }
}

fn collection_prefix(collection: &str) -> String {
    format!("{}{}", collection, PATH_SEPARATOR)
}

fn decode(path: &str, bytes: &[u8]) -> StoreResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidRecord {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Children of `prefix` that are records, not deeper paths.
fn child_key<'a>(prefix: &str, full_key: &'a [u8]) -> Option<&'a str> {
    let key = std::str::from_utf8(full_key.get(prefix.len()..)?).ok()?;
    (!key.is_empty() && !key.contains(PATH_SEPARATOR)).then_some(key)
}

/// Applies `mutate` to the object at `path` until the swap lands.
///
/// `mutate` returns `Ok(None)` to leave the record untouched, `Ok(Some(r))` to
/// commit `r` alongside the new document.
fn modify_record<R, F>(tree: &Tree, path: &str, mut mutate: F) -> StoreResult<Option<R>>
where
    F: FnMut(&mut Map<String, Value>) -> StoreResult<Option<R>>,
{
    loop {
        let current: IVec = match tree.get(path).with_context("Failed to read record")? {
            Some(bytes) => bytes,
            None => return Err(StoreError::missing_record(path)),
        };
        let mut document = decode(path, &current)?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| StoreError::not_an_object(path))?;

        let Some(result) = mutate(object)? else {
            return Ok(None);
        };

        let updated = serde_json::to_vec(&document)?;
        match tree
            .compare_and_swap(path, Some(current), Some(updated))
            .with_context("Failed to swap record")?
        {
            Ok(()) => return Ok(Some(result)),
            Err(_) => {
                trace!("Record {} changed during update, retrying", path);
                continue;
            }
        }
    }
}

#[async_trait]
impl LockStore for SledStore {
    async fn list_children(&self, collection: &str) -> StoreResult<Vec<String>> {
        validate_collection(collection)?;
        let prefix = collection_prefix(collection);
        self.blocking(move |tree| {
            let mut keys = Vec::new();
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (key, _) = item.with_context("Failed to scan collection")?;
                if let Some(child) = child_key(&prefix, &key) {
                    keys.push(child.to_string());
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn read_record(&self, collection: &str, key: &str) -> StoreResult<Option<Value>> {
        validate_collection(collection)?;
        validate_segment(key)?;
        let path = record_path(collection, key);
        self.blocking(move |tree| {
            match tree.get(path.as_bytes()).with_context("Failed to read record")? {
                Some(bytes) => decode(&path, &bytes).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn read_collection(&self, collection: &str) -> StoreResult<Vec<(String, Value)>> {
        validate_collection(collection)?;
        let prefix = collection_prefix(collection);
        self.blocking(move |tree| {
            let mut records = Vec::new();
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (key, value) = item.with_context("Failed to scan collection")?;
                if let Some(child) = child_key(&prefix, &key) {
                    let path = format!("{}{}", prefix, child);
                    records.push((child.to_string(), decode(&path, &value)?));
                }
            }
            Ok(records)
        })
        .await
    }

    async fn read_field(&self, path: &FieldPath) -> StoreResult<Option<Value>> {
        let record = self.read_record(&path.collection, &path.key).await?;
        Ok(record.and_then(|mut r| r.as_object_mut().and_then(|o| o.remove(&path.field))))
    }

    async fn compare_and_set_true(&self, path: &FieldPath) -> StoreResult<bool> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        let record = path.record_path();
        let field = path.field.clone();
        self.blocking(move |tree| {
            // a record that does not exist cannot be locked
            if !tree.contains_key(record.as_bytes()).with_context("Failed to read record")? {
                return Ok(false);
            }
            let committed = modify_record(tree, &record, |object| {
                if is_truthy(object.get(&field)) {
                    return Ok(None);
                }
                object.insert(field.clone(), Value::Bool(true));
                Ok(Some(()))
            })?;
            Ok(committed.is_some())
        })
        .await
    }

    async fn compare_and_set(&self, path: &FieldPath, expected: &Value, value: Value) -> StoreResult<bool> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        validate_segment(&path.field)?;
        let record = path.record_path();
        let field = path.field.clone();
        let expected = expected.clone();
        self.blocking(move |tree| {
            if !tree.contains_key(record.as_bytes()).with_context("Failed to read record")? {
                return Ok(false);
            }
            let committed = modify_record(tree, &record, |object| {
                if object.get(&field) != Some(&expected) {
                    return Ok(None);
                }
                object.insert(field.clone(), value.clone());
                Ok(Some(()))
            })?;
            Ok(committed.is_some())
        })
        .await
    }

    async fn write_field(&self, path: &FieldPath, value: Value) -> StoreResult<()> {
        validate_collection(&path.collection)?;
        validate_segment(&path.key)?;
        validate_segment(&path.field)?;
        let record = path.record_path();
        let field = path.field.clone();
        self.blocking(move |tree| {
            modify_record(tree, &record, |object| {
                object.insert(field.clone(), value.clone());
                Ok(Some(()))
            })
            .map(|_| ())
        })
        .await
    }

    async fn update_record(
        &self,
        collection: &str,
        key: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<()> {
        validate_collection(collection)?;
        validate_segment(key)?;
        let record = record_path(collection, key);
        self.blocking(move |tree| {
            modify_record(tree, &record, |object| {
                for (field, value) in &fields {
                    object.insert(field.clone(), value.clone());
                }
                Ok(Some(()))
            })
            .map(|_| ())
        })
        .await
    }

    async fn push(&self, collection: &str, record: Value) -> StoreResult<String> {
        validate_collection(collection)?;
        if !record.is_object() {
            return Err(StoreError::not_an_object(collection));
        }
        let sequence = self.db.generate_id().with_context("Failed to generate key")?;
        let key = push_key(sequence);
        let path = record_path(collection, &key);
        let bytes = serde_json::to_vec(&record)?;
        self.blocking(move |tree| {
            tree.insert(path.as_bytes(), bytes)
                .map(|_| ())
                .with_context("Failed to insert record")
        })
        .await?;
        Ok(key)
    }

    async fn remove_collection(&self, collection: &str) -> StoreResult<usize> {
        validate_collection(collection)?;
        let prefix = collection_prefix(collection);
        self.blocking(move |tree| {
            let mut batch = sled::Batch::default();
            let mut removed = 0;
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (key, _) = item.with_context("Failed to scan collection")?;
                if child_key(&prefix, &key).is_some() {
                    batch.remove(key);
                    removed += 1;
                }
            }
            tree.apply_batch(batch).with_context("Failed to remove collection")?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const ACCOUNTS: &str = "alfajores/accounts";

    fn open_temp() -> (TempDir, SledStore) {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_push_and_list_in_insertion_order() {
        let (_dir, store) = open_temp();
        let mut keys = Vec::new();
        for i in 0..5 {
            keys.push(store.push(ACCOUNTS, json!({ "n": i })).await.unwrap());
        }
        assert_eq!(store.list_children(ACCOUNTS).await.unwrap(), keys);

        let records = store.read_collection(ACCOUNTS).await.unwrap();
        let ns: Vec<i64> = records.iter().map(|(_, v)| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_collections_do_not_bleed_into_each_other() {
        let (_dir, store) = open_temp();
        store.push(ACCOUNTS, json!({})).await.unwrap();
        store.push("alfajores/accounts2", json!({})).await.unwrap();
        store.push("alfajores/requests", json!({})).await.unwrap();

        assert_eq!(store.list_children(ACCOUNTS).await.unwrap().len(), 1);
        assert_eq!(store.remove_collection(ACCOUNTS).await.unwrap(), 1);
        assert_eq!(store.list_children("alfajores/accounts2").await.unwrap().len(), 1);
        assert_eq!(store.list_children("alfajores/requests").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_true_and_release() {
        let (_dir, store) = open_temp();
        let key = store
            .push(ACCOUNTS, json!({"address": "0x01", "locked": false}))
            .await
            .unwrap();
        let path = FieldPath::new(ACCOUNTS, &key, "locked");

        assert!(store.compare_and_set_true(&path).await.unwrap());
        assert!(!store.compare_and_set_true(&path).await.unwrap());

        store.write_field(&path, json!(false)).await.unwrap();
        assert_eq!(store.read_field(&path).await.unwrap(), Some(json!(false)));

        // other fields survive the field write
        let record = store.read_record(ACCOUNTS, &key).await.unwrap().unwrap();
        assert_eq!(record["address"], json!("0x01"));
    }

    #[tokio::test]
    async fn test_compare_and_set_on_missing_record_does_not_commit() {
        let (_dir, store) = open_temp();
        let path = FieldPath::new(ACCOUNTS, "0000000000000009", "locked");
        assert!(!store.compare_and_set_true(&path).await.unwrap());
        assert!(store.read_record(ACCOUNTS, "0000000000000009").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_true_on_corrupt_record_fails() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        db.open_tree(RECORDS_TREE)
            .unwrap()
            .insert("alfajores/accounts/k1", "not json".as_bytes())
            .unwrap();
        let store = SledStore::from_db(db).unwrap();

        let err = store
            .compare_and_set_true(&FieldPath::new(ACCOUNTS, "k1", "locked"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_status_claim_has_one_winner() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        let key = store
            .push("alfajores/requests", json!({"status": "Pending"}))
            .await
            .unwrap();

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            let path = FieldPath::new("alfajores/requests", &key, "status");
            tokio::spawn(async move {
                store
                    .compare_and_set(&path, &json!("Pending"), json!("Working"))
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);

        let path = FieldPath::new("alfajores/requests", &key, "status");
        assert_eq!(store.read_field(&path).await.unwrap(), Some(json!("Working")));
        assert!(!store
            .compare_and_set(&FieldPath::new("alfajores/requests", "gone", "status"), &json!("Pending"), json!("Working"))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_compare_and_set_has_one_winner() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        let key = store.push(ACCOUNTS, json!({"locked": false})).await.unwrap();

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            let path = FieldPath::new(ACCOUNTS, &key, "locked");
            tokio::spawn(async move { store.compare_and_set_true(&path).await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_update_record_merges_and_flushes() {
        let (_dir, store) = open_temp();
        let key = store
            .push("alfajores/requests", json!({"beneficiary": "0xabc", "status": "Pending"}))
            .await
            .unwrap();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("Working"));
        store.update_record("alfajores/requests", &key, fields).await.unwrap();
        store.flush().await.unwrap();

        let record = store
            .read_record("alfajores/requests", &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record, json!({"beneficiary": "0xabc", "status": "Working"}));
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let (_dir, store) = open_temp();
        let err = store
            .update_record("alfajores/requests", "missing", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
    }
}
