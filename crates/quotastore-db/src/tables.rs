//! Redb table definitions for the top-level storage database.

use redb::TableDefinition;

/// Key of the single row in the `database` and `cache` tables.
pub const SINGLETON_KEY: &str = "";

// Versions. Key: "schema_version" | "cache_version", value: packed u32.
pub const DATABASE: TableDefinition<&str, u32> = TableDefinition::new("database");

/// Keys understood by the `database` table.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const CACHE_VERSION_KEY: &str = "cache_version";

// Usage cache validity. Single row, bincode-encoded `CacheRow`.
pub const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

// Repository id -> repository directory name.
pub const REPOSITORY: TableDefinition<u8, &str> = TableDefinition::new("repository");

// Key: (repository id, origin), value: bincode-encoded `OriginRow`.
pub const ORIGIN: TableDefinition<(u8, &str), &[u8]> = TableDefinition::new("origin");
