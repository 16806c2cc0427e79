//! Blob operations for row storage.
//!
//! Each entity instance is stored as a separate JSON file. Besides the
//! entity's own fields the blob carries the row key, the identity pairs it was
//! stored under, and version/timestamp metadata used for conflict detection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::error::{StorageError, StorageResult};
pub(crate) use crate::storage::types::{BlobId, RowKey};

/// a stored entity row with metadata and entity data
///
/// The internal format stored in Git:
/// ```text
/// {
///   "_key": "3f1c2a9e0d4b7c85a6e21f9b0c3d4e5f6a7b8c9d",
///   "_id": { "name": "x.tld" },
///   "_version": 1,
///   "_created_at": "xxxx-xx-xxT00:00:00Z",
///   "_updated_at": "xxxx-xx-xxT00:00:00Z",
///   "name": "x.tld",
///   "registrar": "abc"
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// row key (must match filename without .json extension)
    pub key: RowKey,
    /// identity attribute values the row is addressed by
    pub identity: BTreeMap<String, Value>,
    /// version number, bumped on every overwrite
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    /// entity fields
    pub data: BTreeMap<String, Value>,
}

impl Row {
    /// creates a new row at version 1, stamped with the current time
    pub fn new(
        key: RowKey,
        identity: BTreeMap<String, Value>,
        data: BTreeMap<String, Value>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            identity,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// create a new row from a serialized entity
    pub fn from_value(
        key: RowKey,
        identity: BTreeMap<String, Value>,
        value: Value,
    ) -> StorageResult<Self> {
        let data = match value {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(StorageError::SchemaViolation(format!(
                    "entity must serialize to a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        Ok(Self::new(key, identity, data))
    }

    /// replace the entity data, keeping creation metadata
    pub fn with_update(self, new_data: BTreeMap<String, Value>) -> Self {
        Self {
            key: self.key,
            identity: self.identity,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: chrono::Utc::now().to_rfc3339(),
            data: new_data,
        }
    }

    /// Look up a column used in a statement filter.
    ///
    /// Identity attributes are matched against the stored identity first so
    /// that attributes read from nested fields still resolve.
    pub fn column(&self, column: &str) -> Option<&Value> {
        self.identity.get(column).or_else(|| self.data.get(column))
    }

    /// the entity as it was serialized by the caller
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone().into_iter().collect::<Map<_, _>>())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// internal format for JSON serialization
///
/// uses `_` prefix for metadata fields to avoid conflicts with entity fields
#[derive(Serialize, Deserialize)]
struct RowJson {
    #[serde(rename = "_key")]
    key: String,
    #[serde(rename = "_id")]
    identity: BTreeMap<String, Value>,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: BTreeMap<String, Value>,
}

/// serialize a row to JSON bytes
///
/// BTreeMap keeps key order stable so identical rows share a blob
pub fn serialize_row(row: &Row) -> StorageResult<Vec<u8>> {
    let json = RowJson {
        key: row.key.as_str().to_string(),
        identity: row.identity.clone(),
        version: row.version,
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
        data: row.data.clone(),
    };

    Ok(serde_json::to_vec_pretty(&json)?)
}

/// deserialize a row from JSON bytes
///
/// validates that the key in the JSON matches the expected key
pub fn deserialize_row(bytes: &[u8], expected_key: &RowKey) -> StorageResult<Row> {
    let json: RowJson = serde_json::from_slice(bytes)?;

    if json.key != expected_key.as_str() {
        return Err(StorageError::CorruptedData {
            path: format!("{}.json", expected_key).into(),
            reason: format!(
                "row key mismatch: file name suggests '{}' but content has '{}'",
                expected_key, json.key
            ),
        });
    }

    Ok(Row {
        key: expected_key.clone(),
        identity: json.identity,
        version: json.version,
        created_at: json.created_at,
        updated_at: json.updated_at,
        data: json.data,
    })
}

/// write a row as a blob to the repository
pub fn write_blob(repo: &git2::Repository, row: &Row) -> StorageResult<BlobId> {
    let bytes = serialize_row(row)?;
    let oid = repo.blob(&bytes)?;
    Ok(BlobId::new(oid))
}

/// read a blob's content from the repository
pub fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}
