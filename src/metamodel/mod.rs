//! Entity metadata.
//!
//! Entity types describe their name and identity attributes through
//! [`Entity::descriptor`]. The [`Metamodel`] validates each descriptor once
//! and caches the result; [`EntityKey`] resolves instances and raw keys
//! against it.

mod descriptor;
mod entity;
mod error;
mod identity;

pub use descriptor::{Accessor, EntityDescriptor, EntityType, IdAttribute, Metamodel};
pub use entity::{Entity, VKey};
pub use error::{MetamodelError, MetamodelResult};
pub use identity::{EntityId, EntityKey};
