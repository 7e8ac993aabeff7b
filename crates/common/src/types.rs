//! Store addressing: collections, record keys and field paths.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PATH_SEPARATOR: char = '/';

/// Collection name for signing accounts under a namespace
pub const ACCOUNTS: &str = "accounts";

/// Collection name for funding requests under a network
pub const REQUESTS: &str = "requests";

/// Address of one field inside a record: `<collection>/<key>/<field>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub collection: String,
    pub key: String,
    pub field: String,
}

impl FieldPath {
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            field: field.into(),
        }
    }

    /// Path of the record holding this field
    pub fn record_path(&self) -> String {
        record_path(&self.collection, &self.key)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.record_path(), PATH_SEPARATOR, self.field)
    }
}

/// `<namespace>/<name>`, e.g. `alfajores/accounts`
pub fn collection_path(namespace: &str, name: &str) -> String {
    format!("{}{}{}", namespace.trim_matches(PATH_SEPARATOR), PATH_SEPARATOR, name)
}

/// `<collection>/<key>`
pub fn record_path(collection: &str, key: &str) -> String {
    format!("{}{}{}", collection, PATH_SEPARATOR, key)
}

/// Push keys are fixed-width hex so that lexicographic order is insertion order.
pub fn push_key(sequence: u64) -> String {
    format!("{:016x}", sequence)
}

/// Rejects empty keys and keys that would address a nested path.
pub fn validate_segment(segment: &str) -> StoreResult<()> {
    if segment.is_empty() {
        return Err(StoreError::InvalidPath("empty path segment".to_string()));
    }
    if segment.contains(PATH_SEPARATOR) {
        return Err(StoreError::InvalidPath(format!(
            "segment '{}' contains '{}'",
            segment, PATH_SEPARATOR
        )));
    }
    Ok(())
}

/// Rejects empty collections and collections with empty segments.
pub fn validate_collection(collection: &str) -> StoreResult<()> {
    if collection.is_empty() {
        return Err(StoreError::InvalidPath("empty collection".to_string()));
    }
    for segment in collection.split(PATH_SEPARATOR) {
        validate_segment(segment)
            .map_err(|_| StoreError::InvalidPath(format!("malformed collection '{}'", collection)))?;
    }
    Ok(())
}

/// Truthiness of a stored field: absent, `null`, `false`, `0` and `""` are falsy.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
