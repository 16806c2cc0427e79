//! The `Entity` trait and typed keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::descriptor::EntityDescriptor;

/// A type stored by the transaction manager.
///
/// Entities serialize to a JSON object. `Key` is the raw key: a scalar for
/// types with one identity attribute, or a struct whose fields are named after
/// the identity attributes for composite keys.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Domain { name: String, registrar: String }
///
/// impl Entity for Domain {
///     type Key = String;
///     fn descriptor() -> EntityDescriptor {
///         EntityDescriptor::single("Domain", "name")
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + 'static {
    type Key: Serialize + DeserializeOwned + Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn descriptor() -> EntityDescriptor;
}

/// A key for one row of entity type `T`.
pub struct VKey<T: Entity> {
    key: T::Key,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> VKey<T> {
    pub fn new(key: T::Key) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// the raw key value
    pub fn key(&self) -> &T::Key {
        &self.key
    }
}

impl<T: Entity> Clone for VKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.key.clone())
    }
}

impl<T: Entity> PartialEq for VKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: Entity> Eq for VKey<T> {}

impl<T: Entity> Hash for VKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T: Entity> fmt::Debug for VKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "VKey<{}>({:?})", short, self.key)
    }
}
