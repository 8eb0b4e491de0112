//! Versioned storage initialization and the IO-side operations
//!
//! Everything in this module runs on the dedicated IO thread. The
//! engine-level state machine is
//! `Uninitialized -> ConnectionOpen -> SchemaUpgraded -> CacheValidated
//! -> TemporaryStorageLoaded -> Ready`; per origin there is a smaller
//! `NotInitialized -> DirectoryEnsured -> MetadataLoaded ->
//! QuotaRegistered` sub-machine.
//!
//! Failure policy: detected corruption is recovered from by deleting
//! and recreating the smallest enclosing unit (one origin directory,
//! the cache rows, or the whole database file); a missing file during a
//! best-effort scan means nothing to do; a future-versioned schema is
//! always fatal.

use crate::eviction::EvictionCandidate;
use crate::io::IoContext;
use quotastore_common::{
    ClientType, ClientUsageArray, Error, FullOriginMetadata, OriginMetadata, OriginScope,
    PersistenceType, Result, now_micros,
};
use quotastore_db::{
    QuotaDb, StorageLayout, load_origin_metadata_with_restore, schema, write_origin_metadata,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Engine-level initialization state, tracked on the owning thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageInitState {
    #[default]
    Uninitialized,
    ConnectionOpen,
    SchemaUpgraded,
    CacheValidated,
    TemporaryStorageLoaded,
    Ready,
}

/// Per-origin initialization sub-machine. Absence from the map means
/// not initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OriginInitState {
    DirectoryEnsured,
    MetadataLoaded,
    QuotaRegistered,
}

// ---- Storage initialization ----

/// Open (creating if absent) the top-level database, apply migrations,
/// and validate the usage cache.
pub(crate) fn init_storage(ctx: &mut IoContext) -> Result<()> {
    let storage_dir = ctx.layout.storage_dir();
    fs::create_dir_all(&storage_dir)?;
    sweep_to_be_removed(&ctx.layout);

    // A private repository can only be left behind by a crashed
    // session; its data must not outlive that session.
    let private_dir = ctx.layout.repository_dir(PersistenceType::Private);
    if private_dir.exists() {
        warn!("removing private repository left behind by a previous session");
        remove_dir_contents_best_effort(&ctx.layout, &private_dir);
    }

    let (db, fresh_db) = QuotaDb::open(&ctx.layout)?;

    let has_repositories = quotastore_common::ALL_PERSISTENCE_TYPES
        .iter()
        .any(|t| ctx.layout.repository_dir(*t).exists());
    schema::upgrade_storage(&db, &ctx.layout, fresh_db && !has_repositories)?;

    ctx.cache_usable = db.maybe_create_or_upgrade_cache()?;
    ctx.db = Some(db);

    info!(root = %ctx.layout.root().display(), "storage initialized");
    Ok(())
}

/// Load (or rebuild) the usage tree for the best-effort repositories
/// and arm the global limit.
pub(crate) fn init_temporary_storage(ctx: &mut IoContext) -> Result<()> {
    let db = ctx
        .db
        .as_ref()
        .ok_or_else(|| Error::bad_parameter("storage not initialized"))?;

    let cache_row = db.cache_row()?;
    let cache_settings = &ctx.config.cache;
    let use_cache = ctx.cache_usable
        && cache_settings.load_from_cache
        && cache_row.valid
        && (!cache_settings.check_build_id || cache_row.build_id == cache_settings.build_id);

    let loaded = use_cache
        && match load_quota_from_cache(ctx) {
            Ok(()) => true,
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                warn!(error = %e, "usage cache unusable, falling back to full scan");
                ctx.tracker.clear();
                false
            }
        };

    if !loaded {
        ctx.tracker.clear();
        for persistence_type in [PersistenceType::Temporary, PersistenceType::Default] {
            init_repository(ctx, persistence_type)?;
        }
        // Rewrite the cache so the next start can skip the scan.
        write_usage_cache(ctx)?;
    }

    ctx.tracker
        .set_limit(ctx.config.storage.temporary_storage_limit);

    info!(
        usage = ctx.tracker.total_usage(),
        limit = ctx.config.storage.temporary_storage_limit,
        from_cache = loaded,
        "temporary storage initialized"
    );
    Ok(())
}

fn load_quota_from_cache(ctx: &mut IoContext) -> Result<()> {
    let db = ctx
        .db
        .as_ref()
        .ok_or_else(|| Error::bad_parameter("storage not initialized"))?;
    let rows = db.load_origins()?;

    for (persistence_type, row) in rows {
        if !matches!(
            persistence_type,
            PersistenceType::Temporary | PersistenceType::Default
        ) {
            continue;
        }

        let client_usages = ClientUsageArray::deserialize(&row.client_usages)
            .map_err(|e| Error::corruption("origin row", e.to_string()))?;
        let metadata = OriginMetadata {
            suffix: row.suffix.clone(),
            group: row.group.clone(),
            origin: row.origin.clone(),
            storage_origin: row.origin.clone(),
            persistence_type,
            is_private: false,
        };
        let full = FullOriginMetadata {
            metadata,
            persisted: row.persisted,
            last_access_time: row.last_access_time,
        };

        if row.accessed {
            // Accessed origins are verified against their directory and
            // re-measured; a mismatch poisons the whole cache load.
            let dir = ctx.layout.origin_dir(persistence_type, &row.origin);
            if !dir.is_dir() {
                return Err(Error::NotFound);
            }
            let disk = load_origin_metadata_with_restore(&dir, persistence_type)?;
            if disk.persisted != full.persisted
                || disk.metadata.storage_origin != full.metadata.storage_origin
            {
                return Err(Error::corruption(
                    "origin row",
                    "cached row disagrees with directory metadata",
                ));
            }
            init_origin_from_scan(ctx, &full, true)?;
        } else {
            ctx.tracker.init_origin(&full, client_usages, false, true);
        }
    }
    Ok(())
}

/// Rebuild usage for one repository by scanning its origin directories.
fn init_repository(ctx: &mut IoContext, persistence_type: PersistenceType) -> Result<()> {
    let repository_dir = ctx.layout.repository_dir(persistence_type);
    let entries = match fs::read_dir(&repository_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return Err(Error::ShutdownAborted);
        }
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            // Best-effort scans tolerate unknown files.
            warn!(path = %entry.path().display(), "unexpected file in repository, skipping");
            continue;
        }
        let origin_dir = entry.path();

        let full = match load_origin_metadata_with_restore(&origin_dir, persistence_type) {
            Ok(full) => full,
            Err(e) => {
                warn!(
                    dir = %origin_dir.display(),
                    error = %e,
                    "unusable origin directory, removing"
                );
                remove_origin_dir(&ctx.layout, &origin_dir);
                continue;
            }
        };

        if let Err(e) = init_origin_from_scan(ctx, &full, false) {
            if e.is_shutdown() {
                return Err(e);
            }
            warn!(
                origin = %full.metadata.origin,
                error = %e,
                "origin initialization failed, removing directory"
            );
            remove_origin_dir(&ctx.layout, &origin_dir);
            ctx.tracker.remove_origin(&full.metadata);
        }
    }
    Ok(())
}

/// Measure every client for one origin and register the result.
fn init_origin_from_scan(
    ctx: &mut IoContext,
    full: &FullOriginMetadata,
    accessed: bool,
) -> Result<()> {
    let mut client_usages = ClientUsageArray::default();
    for client in ctx.clients.iter() {
        let info = client.init_origin(
            full.metadata.persistence_type,
            &full.metadata,
            &ctx.shutdown,
        )?;
        client_usages.set(client.client_type(), info.usage);
    }
    ctx.tracker
        .init_origin(full, client_usages, accessed, true);
    ctx.origin_states.insert(
        (
            full.metadata.persistence_type,
            full.metadata.origin.clone(),
        ),
        OriginInitState::QuotaRegistered,
    );
    Ok(())
}

// ---- Per-origin lazy initialization ----

/// Ensure an origin directory exists with valid metadata and a usage
/// record. Idempotent: a second call returns `created = false` and
/// leaves usage unchanged.
pub(crate) fn ensure_origin_initialized(
    ctx: &mut IoContext,
    metadata: &OriginMetadata,
) -> Result<(std::path::PathBuf, bool)> {
    let key = (metadata.persistence_type, metadata.origin.clone());
    let dir = ctx
        .layout
        .origin_dir(metadata.persistence_type, &metadata.storage_origin);

    if ctx.origin_states.get(&key) == Some(&OriginInitState::QuotaRegistered) {
        return Ok((dir, false));
    }

    let created = !dir.is_dir();
    if created {
        fs::create_dir_all(&dir)?;
    }
    ctx.origin_states
        .insert(key.clone(), OriginInitState::DirectoryEnsured);

    let full = if created {
        let full = FullOriginMetadata {
            metadata: metadata.clone(),
            persisted: false,
            last_access_time: now_micros(),
        };
        write_origin_metadata(&dir, &full)?;
        full
    } else {
        load_origin_metadata_with_restore(&dir, metadata.persistence_type)?
    };
    ctx.origin_states
        .insert(key.clone(), OriginInitState::MetadataLoaded);

    if metadata.persistence_type.is_best_effort() {
        if created {
            ctx.tracker.ensure_origin(&full);
        } else if !ctx.tracker.has_origin(metadata) {
            init_origin_from_scan(ctx, &full, true)?;
        }
    }
    ctx.origin_states.insert(key, OriginInitState::QuotaRegistered);

    debug!(origin = %metadata.origin, created, "origin initialized");
    Ok((dir, created))
}

/// Record an access: bump the in-memory access time and rewrite the
/// on-disk metadata record.
pub(crate) fn save_origin_access_time(
    ctx: &mut IoContext,
    metadata: &OriginMetadata,
    timestamp: i64,
) -> Result<()> {
    ctx.tracker.update_access_time(metadata, timestamp);

    let dir = ctx
        .layout
        .origin_dir(metadata.persistence_type, &metadata.storage_origin);
    if !dir.is_dir() {
        return Ok(());
    }
    let mut full = load_origin_metadata_with_restore(&dir, metadata.persistence_type)?;
    full.last_access_time = timestamp;
    write_origin_metadata(&dir, &full)
}

// ---- Clearing ----

/// Delete every origin matching the scope (optionally restricted to
/// one repository and one client directory).
pub(crate) fn clear_matching_origins(
    ctx: &mut IoContext,
    persistence_type: Option<PersistenceType>,
    origin_scope: &OriginScope,
    client_type: Option<ClientType>,
) -> Result<()> {
    for client in ctx.clients.iter() {
        client.about_to_clear_origins(persistence_type, origin_scope);
    }

    for repository in quotastore_common::ALL_PERSISTENCE_TYPES {
        if persistence_type.is_some_and(|t| t != repository) {
            continue;
        }
        let repository_dir = ctx.layout.repository_dir(repository);
        let entries = match fs::read_dir(&repository_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let origin_dir = entry.path();
            let full = match load_origin_metadata_with_restore(&origin_dir, repository) {
                Ok(full) => full,
                Err(e) => {
                    warn!(
                        dir = %origin_dir.display(),
                        error = %e,
                        "unreadable origin directory during clear, removing"
                    );
                    remove_origin_dir(&ctx.layout, &origin_dir);
                    continue;
                }
            };
            if !origin_scope.matches_origin(&full.metadata.origin) {
                continue;
            }

            if let Some(client_type) = client_type {
                clear_client_directory(ctx, repository, &full.metadata, client_type)?;
            } else {
                clear_one_origin(ctx, repository, &full.metadata, &origin_dir);
            }
        }
    }
    Ok(())
}

fn clear_one_origin(
    ctx: &mut IoContext,
    persistence_type: PersistenceType,
    metadata: &OriginMetadata,
    origin_dir: &Path,
) {
    remove_origin_dir(&ctx.layout, origin_dir);
    ctx.tracker.remove_origin(metadata);
    if let Some(db) = ctx.db.as_ref() {
        if let Err(e) = db.delete_origin(persistence_type, &metadata.origin) {
            warn!(origin = %metadata.origin, error = %e, "failed to drop cached origin row");
        }
    }
    ctx.origin_states
        .remove(&(persistence_type, metadata.origin.clone()));
    for client in ctx.clients.iter() {
        client.on_origin_clear_completed(persistence_type, &metadata.origin);
    }
}

fn clear_client_directory(
    ctx: &mut IoContext,
    persistence_type: PersistenceType,
    metadata: &OriginMetadata,
    client_type: ClientType,
) -> Result<()> {
    let client_dir =
        ctx.layout
            .client_dir(persistence_type, &metadata.storage_origin, client_type);
    match fs::remove_dir_all(&client_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    ctx.tracker
        .reset_usage_for_client(metadata, client_type, None);
    for client in ctx.clients.iter() {
        if client.client_type() == client_type {
            client.on_origin_clear_completed(persistence_type, &metadata.origin);
        }
    }
    Ok(())
}

/// Delete one whole repository.
pub(crate) fn clear_repository(
    ctx: &mut IoContext,
    persistence_type: PersistenceType,
) -> Result<()> {
    for client in ctx.clients.iter() {
        client.about_to_clear_origins(Some(persistence_type), &OriginScope::Null);
    }

    let repository_dir = ctx.layout.repository_dir(persistence_type);
    if repository_dir.exists() {
        remove_dir_contents_best_effort(&ctx.layout, &repository_dir);
        let _ = fs::remove_dir(&repository_dir);
    }
    ctx.tracker.remove_repository(persistence_type);
    if let Some(db) = ctx.db.as_ref() {
        db.delete_origins_for_repository(persistence_type)?;
    }
    ctx.origin_states
        .retain(|(t, _), _| *t != persistence_type);
    for client in ctx.clients.iter() {
        client.on_repository_clear_completed(persistence_type);
    }
    Ok(())
}

/// Wipe the whole storage tree and the database file.
pub(crate) fn clear_all(ctx: &mut IoContext) -> Result<()> {
    for client in ctx.clients.iter() {
        client.about_to_clear_origins(None, &OriginScope::Null);
    }

    // Drop the connection before deleting the file under it.
    ctx.db = None;
    ctx.cache_usable = false;
    ctx.origin_states.clear();
    ctx.tracker.reset();

    let storage_dir = ctx.layout.storage_dir();
    if storage_dir.exists() {
        fs::remove_dir_all(&storage_dir)?;
    }
    match fs::remove_file(ctx.layout.database_file()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    info!("storage cleared");
    Ok(())
}

/// Close down the storage connection: write the usage cache, drop the
/// database handle, forget all in-memory state. Files stay on disk.
pub(crate) fn shutdown_storage(ctx: &mut IoContext) -> Result<()> {
    if ctx.db.is_some() {
        if ctx.cache_usable && ctx.tracker.limit().is_some() {
            if let Err(e) = write_usage_cache(ctx) {
                warn!(error = %e, "failed to write usage cache during shutdown");
            }
        }
        ctx.db = None;
    }
    ctx.origin_states.clear();
    ctx.tracker.reset();
    info!("storage connection shut down");
    Ok(())
}

/// Rewrite the cached origin rows wholesale and mark the cache valid.
fn write_usage_cache(ctx: &IoContext) -> Result<()> {
    let db = ctx
        .db
        .as_ref()
        .ok_or_else(|| Error::bad_parameter("storage not initialized"))?;
    let rows = ctx.tracker.snapshot_rows();
    db.replace_origins(rows.iter().map(|(t, row)| (*t, row)))?;
    db.set_cache_row(true, &ctx.config.cache.build_id)?;
    debug!(rows = rows.len(), "usage cache written");
    Ok(())
}

// ---- Eviction execution ----

/// Delete the chosen candidates: directories first, then in-memory
/// records, then client notifications. Returns the bytes released from
/// the tracked pool.
pub(crate) fn evict_candidates(
    ctx: &mut IoContext,
    candidates: &[EvictionCandidate],
) -> u64 {
    let mut cleared: Vec<&EvictionCandidate> = Vec::new();
    for candidate in candidates {
        if ctx.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let metadata = &candidate.metadata.metadata;
        let dir = ctx
            .layout
            .origin_dir(metadata.persistence_type, &metadata.storage_origin);
        remove_origin_dir(&ctx.layout, &dir);
        cleared.push(candidate);
    }

    let mut freed = 0u64;
    for candidate in &cleared {
        let metadata = &candidate.metadata.metadata;
        freed += ctx.tracker.remove_origin(metadata);
        if let Some(db) = ctx.db.as_ref() {
            if let Err(e) = db.delete_origin(metadata.persistence_type, &metadata.origin) {
                warn!(origin = %metadata.origin, error = %e, "failed to drop cached origin row");
            }
        }
        ctx.origin_states
            .remove(&(metadata.persistence_type, metadata.origin.clone()));
    }

    for candidate in &cleared {
        let metadata = &candidate.metadata.metadata;
        for client in ctx.clients.iter() {
            client.on_origin_clear_completed(metadata.persistence_type, &metadata.origin);
        }
    }

    if freed > 0 {
        info!(origins = cleared.len(), freed, "evicted least-recently-used origins");
    }
    freed
}

// ---- Persist / usage queries ----

/// Pin an origin: exempt its default-persistence data from eviction.
pub(crate) fn persist_origin(ctx: &mut IoContext, metadata: &OriginMetadata) -> Result<()> {
    let mut metadata = metadata.clone();
    metadata.persistence_type = PersistenceType::Default;

    let (dir, _) = ensure_origin_initialized(ctx, &metadata)?;
    let mut full = load_origin_metadata_with_restore(&dir, PersistenceType::Default)?;
    if !full.persisted {
        full.persisted = true;
        write_origin_metadata(&dir, &full)?;
    }
    ctx.tracker.set_origin_persisted(&metadata, true);
    Ok(())
}

/// Usage of an origin's persistent (untracked) repository data.
pub(crate) fn persistent_origin_usage(
    ctx: &IoContext,
    metadata: &OriginMetadata,
) -> Result<u64> {
    let dir = ctx
        .layout
        .origin_dir(PersistenceType::Persistent, &metadata.storage_origin);
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut persistent = metadata.clone();
    persistent.persistence_type = PersistenceType::Persistent;

    let mut total = 0u64;
    for client in ctx.clients.iter() {
        let info = client.init_origin_without_tracking(
            PersistenceType::Persistent,
            &persistent,
            &ctx.shutdown,
        )?;
        total = total.saturating_add(info.usage.unwrap_or(0));
    }
    Ok(total)
}

// ---- Helpers ----

/// Remove an origin directory; when in-place removal fails, stage it
/// under `to-be-removed` for the next initialization sweep.
fn remove_origin_dir(layout: &StorageLayout, dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "direct removal failed, staging");
            let staging = layout.to_be_removed_dir();
            if fs::create_dir_all(&staging).is_ok() {
                let leaf = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("origin");
                let target = staging.join(format!("{leaf}-{}", now_micros()));
                if let Err(e) = fs::rename(dir, &target) {
                    warn!(dir = %dir.display(), error = %e, "staging move failed");
                }
            }
        }
    }
}

fn remove_dir_contents_best_effort(layout: &StorageLayout, dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_origin_dir(layout, &path);
        } else {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Delete everything staged under `to-be-removed`.
fn sweep_to_be_removed(layout: &StorageLayout) {
    let staging = layout.to_be_removed_dir();
    let Ok(entries) = fs::read_dir(&staging) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to sweep staged directory");
        }
    }
}
