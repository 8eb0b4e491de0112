//! Top-level storage database
//!
//! A single redb file under the storage root holds the schema version,
//! the usage-cache validity flag and the cached per-origin usage rows.
//! All access goes through [`QuotaDb`]; reads open a read transaction,
//! every mutation is a write transaction plus commit.
//!
//! A database file that cannot be opened is treated as corruption of the
//! smallest enclosing unit (the file itself): it is deleted and
//! recreated rather than surfaced as a fatal error.

use crate::paths::StorageLayout;
use crate::schema::CACHE_VERSION;
use crate::tables;
use quotastore_common::{PersistenceType, Result};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, error, warn};

/// Usage-cache validity row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    /// Whether the cached origin rows can be trusted.
    pub valid: bool,
    /// Build identifier that wrote the rows.
    pub build_id: String,
}

/// One cached origin record. The repository id lives in the table key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRow {
    pub suffix: String,
    pub group: String,
    pub origin: String,
    /// Textual per-client usage encoding (`K123;C456`).
    pub client_usages: String,
    pub usage: u64,
    pub last_access_time: i64,
    pub accessed: bool,
    pub persisted: bool,
}

/// Handle to the top-level storage database.
pub struct QuotaDb {
    db: Database,
}

impl QuotaDb {
    /// Open (or create) the database under the given layout.
    ///
    /// Returns the handle and whether the file was newly created. An
    /// unreadable existing file is deleted and recreated.
    pub fn open(layout: &StorageLayout) -> Result<(Self, bool)> {
        let path = layout.database_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let existed = path.exists();
        let mut fresh = !existed;
        let db = match Database::create(&path) {
            Ok(db) => db,
            Err(e) => {
                if !existed {
                    return Err(e.into());
                }
                warn!(
                    path = %path.display(),
                    error = %e,
                    "storage database unreadable, deleting and recreating"
                );
                fs::remove_file(&path)?;
                fresh = true;
                Database::create(&path)?
            }
        };

        let quota_db = Self { db };
        quota_db.create_tables()?;

        Ok((quota_db, fresh))
    }

    /// Create all tables eagerly so later read txns don't fail.
    fn create_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::DATABASE)?;
            let _t = write_txn.open_table(tables::CACHE)?;
            let _t = write_txn.open_table(tables::REPOSITORY)?;
            let _t = write_txn.open_table(tables::ORIGIN)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Versions ----

    /// Packed `(major << 16) | minor` schema version; 0 when unset.
    pub fn schema_version(&self) -> Result<u32> {
        self.version(tables::SCHEMA_VERSION_KEY)
    }

    pub fn set_schema_version(&self, version: u32) -> Result<()> {
        self.set_version(tables::SCHEMA_VERSION_KEY, version)
    }

    /// Version of the usage-cache tables; 0 when unset.
    pub fn cache_version(&self) -> Result<u32> {
        self.version(tables::CACHE_VERSION_KEY)
    }

    pub fn set_cache_version(&self, version: u32) -> Result<()> {
        self.set_version(tables::CACHE_VERSION_KEY, version)
    }

    fn version(&self, key: &str) -> Result<u32> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::DATABASE)?;
        Ok(table.get(key)?.map_or(0, |v| v.value()))
    }

    fn set_version(&self, key: &str, version: u32) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::DATABASE)?;
            table.insert(key, version)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Cache validity ----

    pub fn cache_row(&self) -> Result<CacheRow> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CACHE)?;
        match table.get(tables::SINGLETON_KEY)? {
            Some(value) => Ok(bincode::deserialize(value.value())?),
            None => Ok(CacheRow::default()),
        }
    }

    pub fn set_cache_row(&self, valid: bool, build_id: &str) -> Result<()> {
        let row = CacheRow {
            valid,
            build_id: build_id.to_string(),
        };
        let bytes = bincode::serialize(&row)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::CACHE)?;
            table.insert(tables::SINGLETON_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Create the cache tables if missing and upgrade them to the
    /// current cache version. Returns whether the cache is usable at
    /// all (a future cache version makes it unusable, not fatal).
    pub fn maybe_create_or_upgrade_cache(&self) -> Result<bool> {
        let mut version = self.cache_version()?;

        if version > CACHE_VERSION {
            warn!(version, "cache version too new, ignoring cache");
            return Ok(false);
        }

        if version == 0 {
            debug!("creating usage cache");
            self.set_cache_row(false, "")?;
            self.ensure_repositories()?;
            self.set_cache_version(CACHE_VERSION)?;
            return Ok(true);
        }

        while version != CACHE_VERSION {
            match version {
                // 1 -> 2: the textual client_usages encoding changed;
                // previously written rows cannot be trusted.
                1 => {
                    self.invalidate_cache()?;
                    self.set_cache_version(2)?;
                    version = 2;
                }
                _ => {
                    warn!(version, "no cache upgrade path, rebuilding cache");
                    self.invalidate_cache()?;
                    self.set_cache_version(CACHE_VERSION)?;
                    version = CACHE_VERSION;
                }
            }
        }

        Ok(true)
    }

    /// Drop all cached origin rows and mark the cache invalid. Falls
    /// back to only clearing the flag if the rows cannot be removed.
    pub fn invalidate_cache(&self) -> Result<()> {
        let full = (|| -> Result<()> {
            self.clear_origin_rows()?;
            self.set_cache_row(false, "")?;
            Ok(())
        })();
        if let Err(e) = full {
            warn!(error = %e, "cache row purge failed, clearing valid flag only");
            self.set_cache_row(false, "")?;
        }
        Ok(())
    }

    // ---- Repositories ----

    /// Insert the fixed repository id -> name rows.
    pub fn ensure_repositories(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::REPOSITORY)?;
            for persistence_type in quotastore_common::ALL_PERSISTENCE_TYPES {
                table.insert(
                    persistence_type.repository_id(),
                    persistence_type.directory_name(),
                )?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Origin rows ----

    pub fn put_origin(&self, persistence_type: PersistenceType, row: &OriginRow) -> Result<()> {
        let bytes = bincode::serialize(row)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ORIGIN)?;
            table.insert(
                (persistence_type.repository_id(), row.origin.as_str()),
                bytes.as_slice(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace every origin row in one transaction. Used when the usage
    /// cache is rewritten wholesale at shutdown.
    pub fn replace_origins<'a>(
        &self,
        rows: impl IntoIterator<Item = (PersistenceType, &'a OriginRow)>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ORIGIN)?;
            let keys: Vec<(u8, String)> = table
                .iter()?
                .filter_map(|entry| entry.ok())
                .map(|(key, _)| {
                    let (repo, origin) = key.value();
                    (repo, origin.to_string())
                })
                .collect();
            for (repo, origin) in &keys {
                table.remove((*repo, origin.as_str()))?;
            }
            for (persistence_type, row) in rows {
                let bytes = bincode::serialize(row)?;
                table.insert(
                    (persistence_type.repository_id(), row.origin.as_str()),
                    bytes.as_slice(),
                )?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete_origin(&self, persistence_type: PersistenceType, origin: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ORIGIN)?;
            table.remove((persistence_type.repository_id(), origin))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every cached row of one repository.
    pub fn delete_origins_for_repository(
        &self,
        persistence_type: PersistenceType,
    ) -> Result<()> {
        let repository_id = persistence_type.repository_id();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ORIGIN)?;
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|entry| entry.ok())
                .filter(|(key, _)| key.value().0 == repository_id)
                .map(|(key, _)| key.value().1.to_string())
                .collect();
            for origin in &keys {
                table.remove((repository_id, origin.as_str()))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn clear_origin_rows(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ORIGIN)?;
            let keys: Vec<(u8, String)> = table
                .iter()?
                .filter_map(|entry| entry.ok())
                .map(|(key, _)| {
                    let (repo, origin) = key.value();
                    (repo, origin.to_string())
                })
                .collect();
            for (repo, origin) in &keys {
                table.remove((*repo, origin.as_str()))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every cached origin row. Rows that fail to decode or name an
    /// unknown repository are logged and skipped; a bad row is not worth
    /// failing the whole load over.
    pub fn load_origins(&self) -> Result<Vec<(PersistenceType, OriginRow)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ORIGIN)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let (repository_id, origin) = entry.0.value();
            let Some(persistence_type) = PersistenceType::from_repository_id(repository_id)
            else {
                error!(repository_id, origin, "origin row names unknown repository");
                continue;
            };
            match bincode::deserialize::<OriginRow>(entry.1.value()) {
                Ok(row) => result.push((persistence_type, row)),
                Err(e) => error!(origin, error = %e, "failed to decode origin row"),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> QuotaDb {
        let layout = StorageLayout::new(dir.path());
        QuotaDb::open(&layout).unwrap().0
    }

    fn sample_row(origin: &str, usage: u64) -> OriginRow {
        OriginRow {
            suffix: String::new(),
            group: "example.com".to_string(),
            origin: origin.to_string(),
            client_usages: format!("K{usage}"),
            usage,
            last_access_time: 12_345,
            accessed: false,
            persisted: false,
        }
    }

    #[test]
    fn test_open_reports_created() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());

        let (_db, created) = QuotaDb::open(&layout).unwrap();
        assert!(created);

        drop(_db);
        let (_db, created) = QuotaDb::open(&layout).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_corrupt_database_is_recreated() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());

        fs::write(layout.database_file(), b"not a database header").unwrap();

        let (db, _) = QuotaDb::open(&layout).unwrap();
        assert_eq!(db.schema_version().unwrap(), 0);
    }

    #[test]
    fn test_versions_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        assert_eq!(db.schema_version().unwrap(), 0);
        db.set_schema_version((2 << 16) | 3).unwrap();
        assert_eq!(db.schema_version().unwrap(), (2 << 16) | 3);

        assert_eq!(db.cache_version().unwrap(), 0);
        db.set_cache_version(2).unwrap();
        assert_eq!(db.cache_version().unwrap(), 2);
    }

    #[test]
    fn test_cache_row_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        assert_eq!(db.cache_row().unwrap(), CacheRow::default());
        db.set_cache_row(true, "20260806-1").unwrap();
        let row = db.cache_row().unwrap();
        assert!(row.valid);
        assert_eq!(row.build_id, "20260806-1");
    }

    #[test]
    fn test_origin_rows_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let a = sample_row("https://a.example.com", 100);
        let b = sample_row("https://b.example.com", 250);
        db.put_origin(PersistenceType::Default, &a).unwrap();
        db.put_origin(PersistenceType::Temporary, &b).unwrap();

        let mut loaded = db.load_origins().unwrap();
        loaded.sort_by(|x, y| x.1.origin.cmp(&y.1.origin));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], (PersistenceType::Default, a.clone()));
        assert_eq!(loaded[1], (PersistenceType::Temporary, b));

        db.delete_origin(PersistenceType::Default, &a.origin).unwrap();
        assert_eq!(db.load_origins().unwrap().len(), 1);
    }

    #[test]
    fn test_invalidate_cache_drops_rows() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.set_cache_row(true, "x").unwrap();
        db.put_origin(PersistenceType::Default, &sample_row("https://a.example.com", 1))
            .unwrap();

        db.invalidate_cache().unwrap();
        assert!(!db.cache_row().unwrap().valid);
        assert!(db.load_origins().unwrap().is_empty());
    }

    #[test]
    fn test_cache_creation_and_upgrade() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        assert!(db.maybe_create_or_upgrade_cache().unwrap());
        assert_eq!(db.cache_version().unwrap(), CACHE_VERSION);
        assert!(!db.cache_row().unwrap().valid);

        // Stale version upgrades and invalidates.
        db.set_cache_row(true, "x").unwrap();
        db.set_cache_version(1).unwrap();
        assert!(db.maybe_create_or_upgrade_cache().unwrap());
        assert_eq!(db.cache_version().unwrap(), CACHE_VERSION);
        assert!(!db.cache_row().unwrap().valid);

        // Future version is unusable but not fatal.
        db.set_cache_version(CACHE_VERSION + 1).unwrap();
        assert!(!db.maybe_create_or_upgrade_cache().unwrap());
    }
}
