//! End-to-end engine tests against a real storage tree.

use quotastore_common::{
    ClientType, FullOriginMetadata, OriginAttributesPattern, OriginMetadata, OriginScope,
    PersistenceType, QuotaConfig,
};
use quotastore_db::{STORAGE_VERSION, StorageLayout, QuotaDb, write_origin_metadata};
use quotastore_engine::{Client, DirectorySizeClient, QuotaManager, StorageInitState};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MB: u64 = 1024 * 1024;

fn config(root: &TempDir, limit: u64) -> QuotaConfig {
    let mut config = QuotaConfig::default();
    config.storage.root = root.path().to_path_buf();
    config.storage.temporary_storage_limit = limit;
    config
}

fn clients(root: &TempDir) -> Vec<Arc<dyn Client>> {
    let layout = StorageLayout::new(root.path());
    vec![
        Arc::new(DirectorySizeClient::new(ClientType::KeyValue, layout.clone())),
        Arc::new(DirectorySizeClient::new(ClientType::Cache, layout)),
    ]
}

fn manager(root: &TempDir, limit: u64) -> QuotaManager {
    QuotaManager::new(config(root, limit), clients(root))
}

/// Seed an origin directory with a kv payload of `size` bytes and a
/// metadata record carrying the given access time.
fn seed_origin(root: &TempDir, origin: &str, size: u64, access_time: i64) {
    let layout = StorageLayout::new(root.path());
    let metadata = OriginMetadata::new(origin, PersistenceType::Default);
    let kv_dir = layout.client_dir(PersistenceType::Default, origin, ClientType::KeyValue);
    fs::create_dir_all(&kv_dir).unwrap();
    let file = fs::File::create(kv_dir.join("records.bin")).unwrap();
    file.set_len(size).unwrap();

    let origin_dir = layout.origin_dir(PersistenceType::Default, origin);
    write_origin_metadata(
        &origin_dir,
        &FullOriginMetadata {
            metadata,
            persisted: false,
            last_access_time: access_time,
        },
    )
    .unwrap();
}

fn origin_dir_exists(root: &TempDir, origin: &str) -> bool {
    StorageLayout::new(root.path())
        .origin_dir(PersistenceType::Default, origin)
        .is_dir()
}

#[tokio::test]
async fn fresh_root_initializes_to_ready() {
    let root = TempDir::new().unwrap();
    let qm = manager(&root, 100 * MB);

    qm.initialize_temporary_storage().await.unwrap();
    assert_eq!(qm.init_state().await, StorageInitState::Ready);
    assert_eq!(qm.total_usage(), 0);
    drop(qm);

    // The database carries the current schema version and an empty,
    // valid usage cache.
    let layout = StorageLayout::new(root.path());
    let (db, created) = QuotaDb::open(&layout).unwrap();
    assert!(!created);
    assert_eq!(db.schema_version().unwrap(), STORAGE_VERSION);
    assert!(db.cache_row().unwrap().valid);
    assert!(db.load_origins().unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_database_is_recreated_not_fatal() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("storage.db"), b"definitely not a database").unwrap();

    let qm = manager(&root, 100 * MB);
    qm.initialize_storage().await.unwrap();
    assert_eq!(qm.init_state().await, StorageInitState::CacheValidated);
}

#[tokio::test]
async fn shared_client_locks_do_not_wait_exclusive_does() {
    let root = TempDir::new().unwrap();
    let qm = manager(&root, 100 * MB);
    let metadata = OriginMetadata::new("https://example.com", PersistenceType::Default);

    // Two concurrent shared locks on the same origin/client resolve
    // without waiting on each other.
    let first = qm
        .open_client_directory(&metadata, ClientType::KeyValue)
        .await
        .unwrap();
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        qm.open_client_directory(&metadata, ClientType::KeyValue),
    )
    .await
    .expect("second shared lock must not wait")
    .unwrap();

    // An exclusive lock over the same origin blocks until both drop.
    let exclusive = qm.open_storage_directory(
        Some(PersistenceType::Default),
        OriginScope::Origin(metadata.origin.clone()),
        None,
        true,
    );
    tokio::pin!(exclusive);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), exclusive.as_mut())
            .await
            .is_err(),
        "exclusive lock must wait for shared locks"
    );

    drop(first);
    drop(second);
    let lock = tokio::time::timeout(Duration::from_secs(5), exclusive)
        .await
        .expect("exclusive lock must resolve once shared locks drop")
        .unwrap();
    assert!(lock.exclusive());
}

#[tokio::test]
async fn ensure_origin_directory_is_idempotent() {
    let root = TempDir::new().unwrap();
    let qm = manager(&root, 100 * MB);
    let metadata = OriginMetadata::new("https://example.com", PersistenceType::Default);

    let lock = qm
        .open_client_directory(&metadata, ClientType::KeyValue)
        .await
        .unwrap();
    drop(lock);
    let usage_after_first = qm.total_usage();
    assert!(origin_dir_exists(&root, "https://example.com"));

    let lock = qm
        .open_client_directory(&metadata, ClientType::KeyValue)
        .await
        .unwrap();
    drop(lock);
    assert_eq!(qm.total_usage(), usage_after_first);
}

#[tokio::test]
async fn group_limit_eviction_removes_lru_until_under_limit() {
    let root = TempDir::new().unwrap();
    // Group limit = max(50 MB / 5, 10 MB) = 10 MB.
    seed_origin(&root, "https://a.example.com", 6 * MB, 1_000_000);
    seed_origin(&root, "https://b.example.com", 5 * MB, 2_000_000);
    seed_origin(&root, "https://c.example.com", 4 * MB, 3_000_000);

    let qm = manager(&root, 50 * MB);
    qm.initialize_temporary_storage().await.unwrap();

    // 15 MB in one group: evicting the oldest origin (a, 6 MB) brings
    // the group to 9 MB, under the limit; the others survive.
    assert!(!origin_dir_exists(&root, "https://a.example.com"));
    assert!(origin_dir_exists(&root, "https://b.example.com"));
    assert!(origin_dir_exists(&root, "https://c.example.com"));
    assert_eq!(qm.total_usage(), 9 * MB);
}

#[tokio::test]
async fn write_pressure_evicts_lru_origin_synchronously() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://old.example.com", 1_500, 1_000_000);

    let qm = manager(&root, 2_000);
    qm.initialize_temporary_storage().await.unwrap();
    assert_eq!(qm.total_usage(), 1_500);

    let metadata = OriginMetadata::new("https://fresh.other.org", PersistenceType::Default);
    let _lock = qm
        .open_client_directory(&metadata, ClientType::KeyValue)
        .await
        .unwrap();
    let file = StorageLayout::new(root.path())
        .client_dir(PersistenceType::Default, &metadata.origin, ClientType::KeyValue)
        .join("data.bin");
    let quota_object = qm
        .get_quota_object(&metadata, ClientType::KeyValue, file, 0)
        .unwrap();

    // Growing by 1000 bytes would hit 2500 > 2000; the engine must
    // free space by evicting the least-recently-used inactive origin.
    let handle = {
        let quota_object = quota_object.clone();
        std::thread::spawn(move || quota_object.update_size(1_000))
    };
    assert!(handle.join().unwrap());

    assert!(!origin_dir_exists(&root, "https://old.example.com"));
    assert_eq!(qm.total_usage(), 1_000);
}

#[tokio::test]
async fn persisted_origin_is_never_evicted() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://old.example.com", 1_500, 1_000_000);

    let qm = manager(&root, 2_000);
    qm.initialize_temporary_storage().await.unwrap();
    let old = OriginMetadata::new("https://old.example.com", PersistenceType::Default);
    qm.persist_origin(&old).await.unwrap();
    assert!(qm.origin_persisted(&old).await.unwrap());

    let metadata = OriginMetadata::new("https://fresh.other.org", PersistenceType::Default);
    let _lock = qm
        .open_client_directory(&metadata, ClientType::KeyValue)
        .await
        .unwrap();
    let file = StorageLayout::new(root.path())
        .client_dir(PersistenceType::Default, &metadata.origin, ClientType::KeyValue)
        .join("data.bin");
    let quota_object = qm
        .get_quota_object(&metadata, ClientType::KeyValue, file, 0)
        .unwrap();

    // Nothing evictable: the only candidate is pinned, so the write is
    // denied and the pinned origin survives.
    let handle = {
        let quota_object = quota_object.clone();
        std::thread::spawn(move || quota_object.update_size(1_000))
    };
    assert!(!handle.join().unwrap());
    assert!(origin_dir_exists(&root, "https://old.example.com"));
}

#[tokio::test]
async fn usage_cache_is_trusted_only_for_matching_build() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://a.example.com", 500, 1_000_000);

    // First session scans, then writes the cache on storage shutdown.
    {
        let mut cfg = config(&root, 100 * MB);
        cfg.cache.build_id = "build-1".to_string();
        let qm = QuotaManager::new(cfg, clients(&root));
        qm.initialize_temporary_storage().await.unwrap();
        assert_eq!(qm.total_usage(), 500);
        qm.shutdown_storage().await.unwrap();
    }

    // Grow the origin behind the engine's back.
    let layout = StorageLayout::new(root.path());
    let kv_dir = layout.client_dir(
        PersistenceType::Default,
        "https://a.example.com",
        ClientType::KeyValue,
    );
    fs::write(kv_dir.join("extra.bin"), vec![0u8; 250]).unwrap();

    // Same build: the cache is trusted, so the stale figure is served.
    {
        let mut cfg = config(&root, 100 * MB);
        cfg.cache.build_id = "build-1".to_string();
        let qm = QuotaManager::new(cfg, clients(&root));
        qm.initialize_temporary_storage().await.unwrap();
        assert_eq!(qm.total_usage(), 500);
        qm.shutdown_storage().await.unwrap();
    }

    // Different build: the cache is stale, a full rescan runs.
    {
        let mut cfg = config(&root, 100 * MB);
        cfg.cache.build_id = "build-2".to_string();
        let qm = QuotaManager::new(cfg, clients(&root));
        qm.initialize_temporary_storage().await.unwrap();
        assert_eq!(qm.total_usage(), 750);
    }
}

#[tokio::test]
async fn clear_operations_remove_only_matching_origins() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://a.example.com", 100, 1_000_000);
    seed_origin(&root, "https://a.example.com^userContextId=2", 100, 1_000_000);
    seed_origin(&root, "https://b.other.org", 100, 1_000_000);

    let qm = manager(&root, 100 * MB);
    qm.initialize_temporary_storage().await.unwrap();
    assert_eq!(qm.total_usage(), 300);

    // Pattern-scoped clear hits only the matching suffix.
    qm.clear_storages_for_attributes_pattern(&OriginAttributesPattern::parse(
        "userContextId=2",
    ))
    .await
    .unwrap();
    assert!(origin_dir_exists(&root, "https://a.example.com"));
    assert!(!origin_dir_exists(&root, "https://a.example.com^userContextId=2"));
    assert_eq!(qm.total_usage(), 200);

    // Origin-scoped clear hits exactly one origin.
    let a = OriginMetadata::new("https://a.example.com", PersistenceType::Default);
    qm.clear_storages_for_origin(None, &a, None).await.unwrap();
    assert!(!origin_dir_exists(&root, "https://a.example.com"));
    assert!(origin_dir_exists(&root, "https://b.other.org"));
    assert_eq!(qm.total_usage(), 100);
}

#[tokio::test]
async fn get_usage_reports_tracked_and_client_values() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://a.example.com", 640, 1_000_000);

    let qm = manager(&root, 100 * MB);
    let metadata = OriginMetadata::new("https://a.example.com", PersistenceType::Default);

    assert_eq!(qm.get_origin_usage(&metadata).await.unwrap(), 640);
    assert_eq!(
        qm.get_usage_for_client(&metadata, ClientType::KeyValue)
            .await
            .unwrap(),
        Some(640)
    );
    // The cache client holds nothing for this origin.
    assert_eq!(
        qm.get_usage_for_client(&metadata, ClientType::Cache)
            .await
            .unwrap(),
        None
    );
}

#[test]
fn full_shutdown_completes_and_persists_cache() {
    let root = TempDir::new().unwrap();
    seed_origin(&root, "https://a.example.com", 128, 1_000_000);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let qm = manager(&root, 100 * MB);
    runtime.block_on(async {
        qm.initialize_temporary_storage().await.unwrap();
        assert_eq!(qm.total_usage(), 128);
    });

    qm.shutdown();

    let layout = StorageLayout::new(root.path());
    let (db, _) = QuotaDb::open(&layout).unwrap();
    assert!(db.cache_row().unwrap().valid);
    let rows = db.load_origins().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.usage, 128);
}
