//! Quotastore on-disk layer
//!
//! This crate owns everything that touches the storage tree directly:
//! - the top-level redb database holding the schema version and the
//!   per-origin usage cache,
//! - the versioned storage migration chain,
//! - the fixed binary per-origin metadata records,
//! - origin-name sanitization for directory leaf names.
//!
//! All functions here are synchronous and are expected to run on the
//! engine's dedicated IO thread.

pub mod metadata;
pub mod paths;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod tables;

pub use metadata::{
    load_origin_metadata_with_restore, read_origin_metadata, restore_origin_metadata,
    write_origin_metadata,
};
pub use paths::StorageLayout;
pub use sanitize::{parse_origin_leaf, sanitize_origin};
pub use schema::{CACHE_VERSION, STORAGE_VERSION, make_storage_version, upgrade_storage};
pub use store::{CacheRow, OriginRow, QuotaDb};
