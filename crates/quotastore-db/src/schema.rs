//! Storage schema versions and the migration chain
//!
//! The on-disk layout is versioned with a packed `(major << 16) | minor`
//! value kept in the top-level database. Upgrades are a flat,
//! version-indexed table of steps; each step transforms the tree for
//! exactly one `from -> to` pair and the version is bumped only after
//! the step succeeds, so an interrupted upgrade resumes where it
//! stopped. A version this build does not know is a fatal
//! initialization error, never silently dropped.
//!
//! Layout lineage:
//! - 0.0: origin directories sat flat under `storage/`, no metadata
//!   records.
//! - 1.0: repository tier introduced (`permanent`/`temporary`/
//!   `default`), origins moved into `default/`, metadata records
//!   written.
//! - 2.0: the retired `appcache` client was dropped; its directories
//!   are removed.
//! - 2.1: origin directory names re-derived under the current
//!   sanitization algorithm.
//! - 2.2: stray plain files at repository roots removed (only origin
//!   directories are valid entries).
//! - 2.3: usage-cache tables introduced in the top-level database.

use crate::metadata::{read_origin_metadata, restore_origin_metadata};
use crate::paths::{StorageLayout, TO_BE_REMOVED_DIRECTORY_NAME};
use crate::sanitize::sanitize_origin;
use crate::store::QuotaDb;
use quotastore_common::{
    ALL_PERSISTENCE_TYPES, Error, PersistenceType, Result, error::format_version,
};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Pack a storage version.
#[must_use]
pub const fn make_storage_version(major: u32, minor: u32) -> u32 {
    (major << 16) + minor
}

pub const MAJOR_STORAGE_VERSION: u32 = 2;
pub const MINOR_STORAGE_VERSION: u32 = 3;

/// The storage version this build reads and writes.
pub const STORAGE_VERSION: u32 =
    make_storage_version(MAJOR_STORAGE_VERSION, MINOR_STORAGE_VERSION);

/// Version of the usage-cache tables (independent of the layout
/// version; see [`QuotaDb::maybe_create_or_upgrade_cache`]).
pub const CACHE_VERSION: u32 = 2;

/// Everything a migration step may touch.
pub struct MigrationContext<'a> {
    pub db: &'a QuotaDb,
    pub layout: &'a StorageLayout,
}

type MigrationFn = fn(&MigrationContext<'_>) -> Result<()>;

struct MigrationStep {
    from: u32,
    to: u32,
    run: MigrationFn,
}

const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        from: make_storage_version(0, 0),
        to: make_storage_version(1, 0),
        run: upgrade_from_0_0_to_1_0,
    },
    MigrationStep {
        from: make_storage_version(1, 0),
        to: make_storage_version(2, 0),
        run: upgrade_from_1_0_to_2_0,
    },
    MigrationStep {
        from: make_storage_version(2, 0),
        to: make_storage_version(2, 1),
        run: upgrade_from_2_0_to_2_1,
    },
    MigrationStep {
        from: make_storage_version(2, 1),
        to: make_storage_version(2, 2),
        run: upgrade_from_2_1_to_2_2,
    },
    MigrationStep {
        from: make_storage_version(2, 2),
        to: make_storage_version(2, 3),
        run: upgrade_from_2_2_to_2_3,
    },
];

/// Bring the storage tree and database up to [`STORAGE_VERSION`].
///
/// `fresh_install` short-circuits the chain for a root with no prior
/// storage: the version is stamped directly.
pub fn upgrade_storage(
    db: &QuotaDb,
    layout: &StorageLayout,
    fresh_install: bool,
) -> Result<()> {
    let mut version = db.schema_version()?;

    if version > STORAGE_VERSION {
        return Err(Error::VersionTooNew {
            found: version,
            supported: STORAGE_VERSION,
        });
    }

    if version == 0 && fresh_install {
        db.set_schema_version(STORAGE_VERSION)?;
        return Ok(());
    }

    let ctx = MigrationContext { db, layout };
    while version != STORAGE_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|step| step.from == version)
            .ok_or(Error::NoMigrationPath { from: version })?;

        info!(
            from = %format_version(step.from),
            to = %format_version(step.to),
            "upgrading storage"
        );
        (step.run)(&ctx)?;
        db.set_schema_version(step.to)?;
        version = step.to;
    }

    Ok(())
}

/// 0.0 -> 1.0: move flat origin directories into the `default`
/// repository and write metadata records for them.
fn upgrade_from_0_0_to_1_0(ctx: &MigrationContext<'_>) -> Result<()> {
    let storage_dir = ctx.layout.storage_dir();
    if !storage_dir.exists() {
        return Ok(());
    }

    let default_dir = ctx.layout.repository_dir(PersistenceType::Default);
    fs::create_dir_all(&default_dir)?;

    let reserved: Vec<&str> = ALL_PERSISTENCE_TYPES
        .iter()
        .map(|t| t.directory_name())
        .chain([TO_BE_REMOVED_DIRECTORY_NAME])
        .collect();

    for entry in fs::read_dir(&storage_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if reserved.contains(&name) || !entry.file_type()?.is_dir() {
            continue;
        }
        fs::rename(entry.path(), default_dir.join(name))?;
    }

    for_each_origin_dir(&default_dir, |origin_dir| {
        if let Err(e) = restore_origin_metadata(origin_dir, PersistenceType::Default) {
            warn!(
                dir = %origin_dir.display(),
                error = %e,
                "unidentifiable origin directory, removing"
            );
            fs::remove_dir_all(origin_dir)?;
        }
        Ok(())
    })
}

/// 1.0 -> 2.0: remove directories of the retired `appcache` client.
fn upgrade_from_1_0_to_2_0(ctx: &MigrationContext<'_>) -> Result<()> {
    for persistence_type in ALL_PERSISTENCE_TYPES {
        let repository_dir = ctx.layout.repository_dir(persistence_type);
        if !repository_dir.exists() {
            continue;
        }
        for_each_origin_dir(&repository_dir, |origin_dir| {
            let retired = origin_dir.join("appcache");
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// 2.0 -> 2.1: rename origin directories whose leaf names were produced
/// by an older sanitization algorithm.
fn upgrade_from_2_0_to_2_1(ctx: &MigrationContext<'_>) -> Result<()> {
    for persistence_type in ALL_PERSISTENCE_TYPES {
        let repository_dir = ctx.layout.repository_dir(persistence_type);
        if !repository_dir.exists() {
            continue;
        }
        for_each_origin_dir(&repository_dir, |origin_dir| {
            let metadata = match read_origin_metadata(origin_dir, persistence_type) {
                Ok(metadata) => metadata,
                Err(e) if e.is_not_found() || e.is_corruption() => {
                    restore_origin_metadata(origin_dir, persistence_type)?
                }
                Err(e) => return Err(e),
            };

            let current = sanitize_origin(&metadata.metadata.storage_origin);
            let leaf = origin_dir.file_name().and_then(|n| n.to_str());
            if leaf != Some(current.as_str()) {
                let target = repository_dir.join(&current);
                if target.exists() {
                    warn!(
                        dir = %origin_dir.display(),
                        "duplicate origin directory after re-sanitization, removing"
                    );
                    fs::remove_dir_all(origin_dir)?;
                } else {
                    fs::rename(origin_dir, target)?;
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// 2.1 -> 2.2: only origin directories are valid repository entries;
/// drop stray files.
fn upgrade_from_2_1_to_2_2(ctx: &MigrationContext<'_>) -> Result<()> {
    for persistence_type in ALL_PERSISTENCE_TYPES {
        let repository_dir = ctx.layout.repository_dir(persistence_type);
        if !repository_dir.exists() {
            continue;
        }
        for entry in fs::read_dir(&repository_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                warn!(path = %entry.path().display(), "removing stray repository file");
                fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

/// 2.2 -> 2.3: introduce the usage-cache tables.
fn upgrade_from_2_2_to_2_3(ctx: &MigrationContext<'_>) -> Result<()> {
    ctx.db.maybe_create_or_upgrade_cache()?;
    Ok(())
}

/// Run a closure over every subdirectory of a repository directory.
fn for_each_origin_dir(
    repository_dir: &Path,
    mut f: impl FnMut(&Path) -> Result<()>,
) -> Result<()> {
    for entry in fs::read_dir(repository_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            f(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::METADATA_FILE_NAME;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (QuotaDb, StorageLayout) {
        let layout = StorageLayout::new(dir.path());
        let (db, _) = QuotaDb::open(&layout).unwrap();
        (db, layout)
    }

    #[test]
    fn test_fresh_install_stamps_current_version() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        upgrade_storage(&db, &layout, true).unwrap();
        assert_eq!(db.schema_version().unwrap(), STORAGE_VERSION);
    }

    #[test]
    fn test_future_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        db.set_schema_version(make_storage_version(99, 0)).unwrap();
        let err = upgrade_storage(&db, &layout, false).unwrap_err();
        assert!(matches!(err, Error::VersionTooNew { .. }));
    }

    #[test]
    fn test_full_chain_from_flat_layout() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        // A 0.0 tree: origin directories sit directly under storage/.
        let flat = layout.storage_dir().join("https+++example.com");
        fs::create_dir_all(flat.join("kv")).unwrap();
        fs::write(flat.join("kv").join("data.bin"), b"payload").unwrap();

        upgrade_storage(&db, &layout, false).unwrap();

        assert_eq!(db.schema_version().unwrap(), STORAGE_VERSION);
        let migrated = layout.origin_dir(PersistenceType::Default, "https://example.com");
        assert!(migrated.join("kv").join("data.bin").exists());
        assert!(migrated.join(METADATA_FILE_NAME).exists());
        assert!(!flat.exists());
    }

    #[test]
    fn test_appcache_directories_removed() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        let origin_dir = layout.origin_dir(PersistenceType::Default, "https://example.com");
        fs::create_dir_all(origin_dir.join("appcache")).unwrap();
        fs::create_dir_all(origin_dir.join("kv")).unwrap();
        restore_origin_metadata(&origin_dir, PersistenceType::Default).unwrap();

        db.set_schema_version(make_storage_version(1, 0)).unwrap();
        upgrade_storage(&db, &layout, false).unwrap();

        assert!(!origin_dir.join("appcache").exists());
        assert!(origin_dir.join("kv").exists());
    }

    #[test]
    fn test_drifted_leaf_renamed() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        // Directory created by an older sanitizer that kept ':'.
        let repository_dir = layout.repository_dir(PersistenceType::Default);
        let old_dir = repository_dir.join("https+++example.com+8080-old");
        fs::create_dir_all(&old_dir).unwrap();
        let metadata = quotastore_common::FullOriginMetadata {
            metadata: quotastore_common::OriginMetadata::new(
                "https://example.com:8080",
                PersistenceType::Default,
            ),
            persisted: false,
            last_access_time: 1,
        };
        crate::metadata::write_origin_metadata(&old_dir, &metadata).unwrap();

        db.set_schema_version(make_storage_version(2, 0)).unwrap();
        upgrade_storage(&db, &layout, false).unwrap();

        assert!(!old_dir.exists());
        assert!(
            layout
                .origin_dir(PersistenceType::Default, "https://example.com:8080")
                .join(METADATA_FILE_NAME)
                .exists()
        );
    }

    #[test]
    fn test_missing_step_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (db, layout) = setup(&dir);

        db.set_schema_version(make_storage_version(0, 7)).unwrap();
        let err = upgrade_storage(&db, &layout, false).unwrap_err();
        assert!(matches!(err, Error::NoMigrationPath { .. }));
    }
}
