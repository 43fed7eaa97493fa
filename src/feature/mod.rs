//! Feature tree: ordered, replicated points, routes and groups.
//!
//! # Module Structure
//!
//! - `order` - Fractional ordering keys (`At`)
//! - `types` - `Feature` and its kinds
//! - `store` - `FeatureStore` (live map + trash + child index)
//! - `tree` - Tree queries and mutations
//! - `select` - Derived views (geometry, sprites, bounds)

pub mod order;
pub mod select;
pub mod store;
pub mod tree;
pub mod types;

pub use order::At;
pub use store::{FeatureMap, FeatureStore};
pub use tree::{Direction, FeatureUpdate};
pub use types::{Feature, FeatureKind, ROOT_FEATURE};

use thiserror::Error;

/// Errors raised by feature tree mutations.
///
/// All of these are programming errors: the mutation is rejected before
/// anything is written.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeatureError {
    #[error("feature not found: {0}")]
    NotFound(String),

    #[error("feature `{id}`: field `{field}` cannot be changed")]
    ImmutableField { id: String, field: String },

    #[error("feature `{id}`: invalid value for `{field}`: {reason}")]
    InvalidUpdate {
        id: String,
        field: String,
        reason: String,
    },

    #[error("invalid ordering key `{0}`")]
    InvalidKey(String),
}
