//! Configuration types for Quotastore
//!
//! This module defines the configuration structures consumed by the
//! engine and the admin CLI.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a quota engine instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Storage tree and limits
    pub storage: StorageSettings,
    /// Usage cache behavior
    pub cache: CacheSettings,
    /// Shutdown watchdog timeouts
    pub shutdown: ShutdownSettings,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            cache: CacheSettings::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

/// Storage tree location and quota limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory; the engine owns `<root>/storage/` and
    /// `<root>/storage.db` beneath it.
    pub root: PathBuf,
    /// Global byte limit for the best-effort pool.
    pub temporary_storage_limit: u64,
    /// Origin scheme prefixes whose default/private-persistence data is
    /// never evicted (installed-extension style principals).
    pub extension_schemes: Vec<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/quotastore"),
            temporary_storage_limit: 2 * 1024 * 1024 * 1024, // 2 GB
            extension_schemes: vec!["moz-extension://".to_string()],
        }
    }
}

/// Usage cache behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Build identifier written into the cache; a mismatch on startup
    /// forces a full directory rescan.
    pub build_id: String,
    /// Whether a build id mismatch invalidates the cache.
    pub check_build_id: bool,
    /// Whether to load usage from the cache at all (disable to force a
    /// rescan on every start).
    pub load_from_cache: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            build_id: "dev".to_string(),
            check_build_id: true,
            load_from_cache: true,
        }
    }
}

/// Shutdown watchdog timeouts (milliseconds). Both are shutdown-only and
/// escalate: the first force-aborts outstanding client work, the second
/// terminates the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// How long to wait for clients before force-killing their actors.
    pub force_kill_timeout_ms: u64,
    /// How long the whole shutdown may take before the process aborts.
    pub fatal_timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            force_kill_timeout_ms: 5_000,
            fatal_timeout_ms: 45_000,
        }
    }
}

/// Group limit derived from the global limit: a fifth of the total, but
/// never below 10 MB and never above the total itself.
#[must_use]
pub const fn group_limit(temporary_storage_limit: u64) -> u64 {
    const MIN_GROUP_LIMIT: u64 = 10 * 1024 * 1024;

    let fifth = temporary_storage_limit / 5;
    let floor = if fifth > MIN_GROUP_LIMIT {
        fifth
    } else {
        MIN_GROUP_LIMIT
    };
    if floor < temporary_storage_limit {
        floor
    } else {
        temporary_storage_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuotaConfig::default();
        assert_eq!(config.storage.temporary_storage_limit, 2 * 1024 * 1024 * 1024);
        assert!(config.cache.check_build_id);
        assert!(config.shutdown.fatal_timeout_ms > config.shutdown.force_kill_timeout_ms);
    }

    #[test]
    fn test_group_limit() {
        // Large pool: a fifth of the total.
        assert_eq!(group_limit(1000 * 1024 * 1024), 200 * 1024 * 1024);
        // Small pool: floored at 10 MB but capped at the total.
        assert_eq!(group_limit(20 * 1024 * 1024), 10 * 1024 * 1024);
        assert_eq!(group_limit(4 * 1024 * 1024), 4 * 1024 * 1024);
    }
}
