//! Entity metadata errors.
//!
//! All of these point at a mapping bug in an entity definition, never at
//! data, so callers treat them as configuration failures.

use thiserror::Error;

use crate::storage::InvalidNameError;

#[derive(Debug, Error)]
pub enum MetamodelError {
    /// an identity attribute could not be read from an entity or raw key
    #[error("entity {entity} has no identity attribute {attribute}")]
    UnknownAttribute { entity: String, attribute: String },

    /// the descriptor itself is malformed
    #[error("invalid descriptor for {entity}: {reason}")]
    InvalidDescriptor { entity: String, reason: String },

    #[error("invalid entity name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// an entity or key did not serialize to JSON
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MetamodelResult<T> = Result<T, MetamodelError>;
