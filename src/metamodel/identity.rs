//! Identity resolution.
//!
//! Turns an entity instance or a raw key into the ordered `(attribute, value)`
//! pairs that identify one row.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::descriptor::EntityType;
use super::error::{MetamodelError, MetamodelResult};
use crate::sql::{self, Bindings};
use crate::storage::{EntityName, InvalidNameError, RowKey};

/// One identity attribute and its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityId {
    pub name: String,
    pub value: Value,
}

/// Identity of one row: non-empty, names unique, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    entity: EntityName,
    ids: Vec<EntityId>,
}

impl EntityKey {
    /// Resolve the identity of a serialized entity instance.
    pub fn from_entity(entity_type: &EntityType, entity: &Value) -> MetamodelResult<Self> {
        let ids = entity_type
            .attributes()
            .iter()
            .map(|attr| {
                let value = attr.read(entity).ok_or_else(|| unknown(entity_type, attr.name()))?;
                Ok(EntityId {
                    name: attr.name().to_string(),
                    value,
                })
            })
            .collect::<MetamodelResult<Vec<_>>>()?;

        Ok(Self {
            entity: entity_type.name().clone(),
            ids,
        })
    }

    /// Resolve the identity of a raw key.
    ///
    /// For single-identity types the raw value is the identity value. For
    /// composite types it must be an object carrying one field per attribute.
    pub fn from_sql_key(entity_type: &EntityType, raw: &Value) -> MetamodelResult<Self> {
        let ids = if entity_type.is_composite() {
            let holder = raw.as_object().ok_or_else(|| MetamodelError::InvalidDescriptor {
                entity: entity_type.name().to_string(),
                reason: format!("composite key must be an object, got {}", raw),
            })?;
            entity_type
                .attribute_names()
                .map(|name| match holder.get(name) {
                    Some(value) if !value.is_null() => Ok(EntityId {
                        name: name.to_string(),
                        value: value.clone(),
                    }),
                    _ => Err(unknown(entity_type, name)),
                })
                .collect::<MetamodelResult<Vec<_>>>()?
        } else {
            let name = entity_type
                .attribute_names()
                .next()
                .ok_or_else(|| unknown(entity_type, "<none>"))?;
            vec![EntityId {
                name: name.to_string(),
                value: raw.clone(),
            }]
        };

        Ok(Self {
            entity: entity_type.name().clone(),
            ids,
        })
    }

    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(|id| id.name.as_str())
    }

    /// `"a" = :a AND "b" = :b` over every identity attribute.
    pub fn and_clause(&self) -> String {
        sql::and_clause(self.names())
    }

    /// Each identity value bound under its attribute name.
    pub fn bindings(&self) -> Bindings {
        let mut bindings = Bindings::new();
        for id in &self.ids {
            bindings.insert(id.name.clone(), id.value.clone());
        }
        bindings
    }

    /// Storage key derived from the identity values in order.
    pub fn row_key(&self) -> Result<RowKey, InvalidNameError> {
        let values: Vec<&Value> = self.ids.iter().map(|id| &id.value).collect();
        RowKey::from_identity(&values)
    }

    pub fn identity(&self) -> BTreeMap<String, Value> {
        self.ids.iter().map(|id| (id.name.clone(), id.value.clone())).collect()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity)?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", id.name, id.value)?;
        }
        write!(f, ")")
    }
}

fn unknown(entity_type: &EntityType, attribute: &str) -> MetamodelError {
    MetamodelError::UnknownAttribute {
        entity: entity_type.name().to_string(),
        attribute: attribute.to_string(),
    }
}
