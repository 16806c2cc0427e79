//! Replication log.
//!
//! While a transaction is open with replication enabled, every update and
//! delete the manager performs is noted in a [`ReplicationLogBuilder`]. Just
//! before commit the builder is turned into a [`ReplicationRecord`] and, if it
//! is not empty, persisted as a [`TransactionEntity`] through the same session
//! so it commits or rolls back together with the work it describes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use super::error::TransactionResult;
use crate::metamodel::{Entity, EntityDescriptor, EntityKey};

/// One change to one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Update {
        entity: String,
        key: BTreeMap<String, Value>,
        value: Value,
    },
    Delete {
        entity: String,
        key: BTreeMap<String, Value>,
    },
}

impl Mutation {
    pub fn entity(&self) -> &str {
        match self {
            Mutation::Update { entity, .. } | Mutation::Delete { entity, .. } => entity,
        }
    }

    pub fn key(&self) -> &BTreeMap<String, Value> {
        match self {
            Mutation::Update { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Mutation::Delete { .. })
    }
}

/// Accumulates the mutations of one transaction in the order they were
/// made. Repeated changes to one row are all kept.
#[derive(Debug, Default)]
pub struct ReplicationLogBuilder {
    mutations: Vec<Mutation>,
}

impl ReplicationLogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note an insert or replace. `value` is snapshotted now.
    pub fn add_update(&mut self, key: &EntityKey, value: Value) {
        self.mutations.push(Mutation::Update {
            entity: key.entity().to_string(),
            key: key.identity(),
            value,
        });
    }

    pub fn add_delete(&mut self, key: &EntityKey) {
        self.mutations.push(Mutation::Delete {
            entity: key.entity().to_string(),
            key: key.identity(),
        });
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Freeze the log. The builder is consumed.
    pub fn build(self) -> ReplicationRecord {
        ReplicationRecord {
            mutations: self.mutations,
        }
    }
}

/// Everything one committed transaction changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicationRecord {
    mutations: Vec<Mutation>,
}

impl ReplicationRecord {
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn updates(&self) -> impl Iterator<Item = &Mutation> {
        self.mutations.iter().filter(|m| !m.is_delete())
    }

    pub fn deletes(&self) -> impl Iterator<Item = &Mutation> {
        self.mutations.iter().filter(|m| m.is_delete())
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// Persisted form of a replication record, stored as entity `Transaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntity {
    /// ULID, so ids sort by creation time
    pub id: String,
    pub transaction_time: DateTime<Utc>,
    /// JSON text of the record
    pub contents: String,
}

impl TransactionEntity {
    pub fn new(record: &ReplicationRecord, transaction_time: DateTime<Utc>) -> TransactionResult<Self> {
        Ok(Self {
            id: Ulid::new().to_string(),
            transaction_time,
            contents: serde_json::to_string(record)?,
        })
    }

    /// Decode the stored record.
    pub fn record(&self) -> TransactionResult<ReplicationRecord> {
        Ok(serde_json::from_str(&self.contents)?)
    }
}

impl Entity for TransactionEntity {
    type Key = String;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::single("Transaction", "id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::EntityType;
    use serde_json::json;

    fn domain() -> EntityType {
        EntityDescriptor::single("Domain", "name").validate().unwrap()
    }

    fn key(name: &str) -> EntityKey {
        EntityKey::from_sql_key(&domain(), &json!(name)).unwrap()
    }

    #[test]
    fn test_builder_keeps_every_mutation_in_order() {
        let mut builder = ReplicationLogBuilder::new();
        assert!(builder.is_empty());

        builder.add_update(&key("a"), json!({"name": "a", "v": 1}));
        builder.add_update(&key("b"), json!({"name": "b"}));
        builder.add_update(&key("a"), json!({"name": "a", "v": 2}));
        builder.add_delete(&key("b"));

        let record = builder.build();
        assert_eq!(record.len(), 4);
        assert_eq!(
            record.mutations()[0],
            Mutation::Update {
                entity: "Domain".into(),
                key: key("a").identity(),
                value: json!({"name": "a", "v": 1}),
            }
        );
        assert_eq!(
            record.mutations()[2],
            Mutation::Update {
                entity: "Domain".into(),
                key: key("a").identity(),
                value: json!({"name": "a", "v": 2}),
            }
        );
        assert!(record.mutations()[3].is_delete());
        assert_eq!(record.updates().count(), 3);
        assert_eq!(record.deletes().count(), 1);
    }

    #[test]
    fn test_transaction_entity_round_trip() {
        let mut builder = ReplicationLogBuilder::new();
        builder.add_delete(&key("gone"));
        let record = builder.build();

        let entity = TransactionEntity::new(&record, Utc::now()).unwrap();
        assert!(entity.contents.contains("\"op\":\"delete\""));
        assert_eq!(entity.record().unwrap(), record);
    }

    #[test]
    fn test_transaction_descriptor_is_valid() {
        let ty = TransactionEntity::descriptor().validate().unwrap();
        assert_eq!(ty.name().as_str(), "Transaction");
    }
}
