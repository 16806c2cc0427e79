//! Entity descriptors and the metamodel cache.
//!
//! A descriptor is what an entity type declares about itself: its name and
//! its identity attributes in declaration order. Each attribute carries the
//! accessor used to read it from a serialized entity; the default reads the
//! top-level field of the same name. Descriptors are validated into an
//! [`EntityType`] once per type and cached in the [`Metamodel`].

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::entity::Entity;
use super::error::{MetamodelError, MetamodelResult};
use crate::storage::EntityName;

/// Reads one identity value out of a serialized entity.
pub type Accessor = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// One identity attribute and how to read it.
#[derive(Clone)]
pub struct IdAttribute {
    name: String,
    accessor: Accessor,
}

impl IdAttribute {
    /// attribute read from the top-level field of the same name
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        let field = name.clone();
        Self {
            name,
            accessor: Arc::new(move |entity: &Value| entity.get(&field).cloned()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the attribute from an entity. Null counts as missing.
    pub fn read(&self, entity: &Value) -> Option<Value> {
        (self.accessor)(entity).filter(|v| !v.is_null())
    }
}

impl fmt::Debug for IdAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAttribute").field("name", &self.name).finish()
    }
}

/// Builder-style declaration of an entity's name and identity.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    name: String,
    attributes: Vec<IdAttribute>,
    composite: bool,
    /// accessor overrides naming attributes that were never declared
    dangling_accessors: Vec<String>,
}

impl EntityDescriptor {
    /// An entity identified by one attribute.
    pub fn single(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: vec![IdAttribute::field(attribute)],
            composite: false,
            dangling_accessors: Vec::new(),
        }
    }

    /// An entity identified by several attributes, in declaration order.
    pub fn composite<I, S>(name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            attributes: attributes.into_iter().map(IdAttribute::field).collect(),
            composite: true,
            dangling_accessors: Vec::new(),
        }
    }

    /// Replace the accessor of a declared attribute, e.g. to read it from a
    /// nested field.
    pub fn with_accessor<F>(mut self, attribute: &str, accessor: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        match self.attributes.iter_mut().find(|a| a.name == attribute) {
            Some(attr) => attr.accessor = Arc::new(accessor),
            None => self.dangling_accessors.push(attribute.to_string()),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check the descriptor and produce the validated type.
    pub fn validate(self) -> MetamodelResult<EntityType> {
        let invalid = |reason: String| MetamodelError::InvalidDescriptor {
            entity: self.name.clone(),
            reason,
        };

        let name = EntityName::new(self.name.as_str())?;

        if self.attributes.is_empty() {
            return Err(invalid("no identity attributes".into()));
        }
        if !self.composite && self.attributes.len() != 1 {
            return Err(invalid("single identity must have exactly one attribute".into()));
        }
        if let Some(attr) = self.dangling_accessors.first() {
            return Err(MetamodelError::UnknownAttribute {
                entity: self.name.clone(),
                attribute: attr.clone(),
            });
        }

        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if !is_parameter_name(&attr.name) {
                return Err(invalid(format!("'{}' is not a valid attribute name", attr.name)));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(invalid(format!("duplicate attribute '{}'", attr.name)));
            }
        }

        Ok(EntityType {
            name,
            attributes: self.attributes,
            composite: self.composite,
        })
    }
}

/// attribute names double as statement parameter names
fn is_parameter_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A validated entity descriptor.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: EntityName,
    attributes: Vec<IdAttribute>,
    composite: bool,
}

impl EntityType {
    pub fn name(&self) -> &EntityName {
        &self.name
    }

    pub fn attributes(&self) -> &[IdAttribute] {
        &self.attributes
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(IdAttribute::name)
    }

    /// whether raw keys are identity-holder objects rather than scalars
    pub fn is_composite(&self) -> bool {
        self.composite
    }
}

/// Validated entity types keyed by Rust type.
#[derive(Default)]
pub struct Metamodel {
    types: RwLock<HashMap<TypeId, Arc<EntityType>>>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and cache `T`'s descriptor, replacing any previous entry.
    pub fn register<T: Entity>(&self) -> MetamodelResult<Arc<EntityType>> {
        let entity_type = Arc::new(T::descriptor().validate()?);
        self.types.write().insert(TypeId::of::<T>(), entity_type.clone());
        Ok(entity_type)
    }

    /// The cached type for `T`, registering it on first use.
    pub fn entity_type<T: Entity>(&self) -> MetamodelResult<Arc<EntityType>> {
        if let Some(found) = self.types.read().get(&TypeId::of::<T>()) {
            return Ok(found.clone());
        }
        self.register::<T>()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl fmt::Debug for Metamodel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.types.read().values().map(|t| t.name.to_string()).collect();
        f.debug_struct("Metamodel").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Host {
        name: String,
    }

    impl Entity for Host {
        type Key = String;
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::single("Host", "name")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Broken {
        id: String,
    }

    impl Entity for Broken {
        type Key = String;
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::composite("Broken", Vec::<String>::new())
        }
    }

    #[test]
    fn test_validate_single() {
        let ty = EntityDescriptor::single("Domain", "name").validate().unwrap();
        assert_eq!(ty.name().as_str(), "Domain");
        assert_eq!(ty.attribute_names().collect::<Vec<_>>(), vec!["name"]);
        assert!(!ty.is_composite());
    }

    #[test]
    fn test_validate_rejects_bad_descriptors() {
        assert!(matches!(
            EntityDescriptor::single("bad-name", "id").validate(),
            Err(MetamodelError::InvalidName(_))
        ));
        assert!(matches!(
            EntityDescriptor::composite("E", ["a", "a"]).validate(),
            Err(MetamodelError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            EntityDescriptor::single("E", "a b").validate(),
            Err(MetamodelError::InvalidDescriptor { .. })
        ));
        assert!(matches!(
            EntityDescriptor::single("E", "id")
                .with_accessor("nope", |_| None)
                .validate(),
            Err(MetamodelError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_custom_accessor() {
        let ty = EntityDescriptor::composite("HostHistory", ["host", "revision"])
            .with_accessor("host", |e| e.pointer("/parent/host").cloned())
            .validate()
            .unwrap();

        let entity = json!({"parent": {"host": "ns1.x.tld"}, "revision": 4});
        let values: Vec<_> = ty.attributes().iter().map(|a| a.read(&entity)).collect();
        assert_eq!(values, vec![Some(json!("ns1.x.tld")), Some(json!(4))]);
        assert_eq!(ty.attributes()[0].read(&json!({"host": null})), None);
    }

    #[test]
    fn test_metamodel_caches_types() {
        let metamodel = Metamodel::new();
        assert!(metamodel.is_empty());

        let first = metamodel.entity_type::<Host>().unwrap();
        let second = metamodel.entity_type::<Host>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(metamodel.len(), 1);

        assert!(metamodel.entity_type::<Broken>().is_err());
        assert_eq!(metamodel.len(), 1);
    }
}
