//! Storage client collaborators
//!
//! Each client subsystem (key-value store, cache, local storage) owns
//! the data inside its client directories and reports usage to the
//! engine through this contract. All calls except the shutdown group
//! happen on the engine's IO thread; long-running work must check the
//! cancellation flag at safe points.

use crate::locks::LockScope;
use quotastore_common::{
    ClientType, OriginMetadata, PersistenceType, Result, error::ok_if_not_found,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Usage measured by a client for one origin. `None` means the client
/// holds nothing there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub usage: Option<u64>,
}

impl UsageInfo {
    #[must_use]
    pub const fn new(usage: u64) -> Self {
        Self { usage: Some(usage) }
    }

    pub fn append(&mut self, bytes: u64) {
        self.usage = Some(self.usage.unwrap_or(0).saturating_add(bytes));
    }
}

/// Contract every storage client subsystem implements.
pub trait Client: Send + Sync {
    fn client_type(&self) -> ClientType;

    /// Measure (and if needed repair) this client's data for an origin,
    /// registering live files with the quota machinery.
    fn init_origin(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        cancel: &AtomicBool,
    ) -> Result<UsageInfo>;

    /// Measure without registering anything (persistent origins and
    /// one-off usage queries).
    fn init_origin_without_tracking(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        cancel: &AtomicBool,
    ) -> Result<UsageInfo>;

    /// Called before origin directories inside the scope are deleted.
    fn about_to_clear_origins(
        &self,
        persistence_type: Option<PersistenceType>,
        origin_scope: &quotastore_common::OriginScope,
    );

    /// Called after one origin's data is gone.
    fn on_origin_clear_completed(&self, persistence_type: PersistenceType, origin: &str);

    /// Called after a whole repository is gone.
    fn on_repository_clear_completed(&self, persistence_type: PersistenceType);

    /// Abort in-flight work overlapping the given lock scopes.
    fn abort_operations_for_locks(&self, scopes: &[LockScope]);

    /// Abort all in-flight work for the process.
    fn abort_operations_for_process(&self);

    /// Begin closing worker threads; returns whether the engine must
    /// wait for [`Client::is_shutdown_completed`].
    fn initiate_shutdown_work_threads(&self) -> bool;

    /// Join worker threads. Only called once shutdown is complete (or
    /// was forced).
    fn finalize_shutdown_work_threads(&self);

    /// Hard-abort remaining actors after the force-kill timeout.
    fn force_kill_actors(&self);

    fn is_shutdown_completed(&self) -> bool;
}

/// Fixed registry of clients, one slot per [`ClientType`].
#[derive(Default)]
pub struct Clients {
    slots: [Option<std::sync::Arc<dyn Client>>; quotastore_common::CLIENT_TYPE_COUNT],
}

impl Clients {
    #[must_use]
    pub fn new(clients: Vec<std::sync::Arc<dyn Client>>) -> Self {
        let mut registry = Self::default();
        for client in clients {
            let index = client.client_type().index();
            registry.slots[index] = Some(client);
        }
        registry
    }

    #[must_use]
    pub fn get(&self, client_type: ClientType) -> Option<&std::sync::Arc<dyn Client>> {
        self.slots[client_type.index()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<dyn Client>> {
        self.slots.iter().flatten()
    }
}

/// Reference client that owns everything under its client directory and
/// measures usage by walking it. Real clients bring their own formats;
/// this one backs the admin CLI and the tests.
pub struct DirectorySizeClient {
    client_type: ClientType,
    layout: quotastore_db::StorageLayout,
    shutdown_initiated: AtomicBool,
}

impl DirectorySizeClient {
    #[must_use]
    pub fn new(client_type: ClientType, layout: quotastore_db::StorageLayout) -> Self {
        Self {
            client_type,
            layout,
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    fn measure(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        cancel: &AtomicBool,
    ) -> Result<UsageInfo> {
        let dir = self.layout.client_dir(
            persistence_type,
            &metadata.storage_origin,
            self.client_type,
        );
        if !dir.exists() {
            return Ok(UsageInfo::default());
        }
        let mut info = UsageInfo::new(0);
        walk_dir_size(&dir, cancel, &mut info)?;
        Ok(info)
    }
}

impl Client for DirectorySizeClient {
    fn client_type(&self) -> ClientType {
        self.client_type
    }

    fn init_origin(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        cancel: &AtomicBool,
    ) -> Result<UsageInfo> {
        self.measure(persistence_type, metadata, cancel)
    }

    fn init_origin_without_tracking(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        cancel: &AtomicBool,
    ) -> Result<UsageInfo> {
        self.measure(persistence_type, metadata, cancel)
    }

    fn about_to_clear_origins(
        &self,
        _persistence_type: Option<PersistenceType>,
        _origin_scope: &quotastore_common::OriginScope,
    ) {
    }

    fn on_origin_clear_completed(&self, _persistence_type: PersistenceType, _origin: &str) {}

    fn on_repository_clear_completed(&self, _persistence_type: PersistenceType) {}

    fn abort_operations_for_locks(&self, _scopes: &[LockScope]) {}

    fn abort_operations_for_process(&self) {}

    fn initiate_shutdown_work_threads(&self) -> bool {
        self.shutdown_initiated.store(true, Ordering::SeqCst);
        false
    }

    fn finalize_shutdown_work_threads(&self) {}

    fn force_kill_actors(&self) {}

    fn is_shutdown_completed(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }
}

/// Sum file sizes under a directory, checking the cancel flag between
/// entries. Entries vanishing mid-walk are expected (concurrent
/// deletion) and skipped.
pub fn walk_dir_size(dir: &Path, cancel: &AtomicBool, info: &mut UsageInfo) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        if cancel.load(Ordering::Relaxed) {
            return Err(quotastore_common::Error::ShutdownAborted);
        }
        let entry = entry?;
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if file_type.is_dir() {
            walk_dir_size(&entry.path(), cancel, info)?;
        } else {
            let size = ok_if_not_found(
                entry.metadata().map(|m| m.len()).map_err(Into::into),
            )?;
            info.append(size);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotastore_db::StorageLayout;
    use tempfile::TempDir;

    #[test]
    fn test_walk_dir_size() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("nested").join("b.bin"), vec![0u8; 50]).unwrap();

        let mut info = UsageInfo::default();
        walk_dir_size(dir.path(), &AtomicBool::new(false), &mut info).unwrap();
        assert_eq!(info.usage, Some(150));
    }

    #[test]
    fn test_walk_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut info = UsageInfo::default();
        walk_dir_size(&dir.path().join("gone"), &AtomicBool::new(false), &mut info).unwrap();
        assert_eq!(info.usage, None);
    }

    #[test]
    fn test_walk_respects_cancel() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();

        let mut info = UsageInfo::default();
        let err = walk_dir_size(dir.path(), &AtomicBool::new(true), &mut info).unwrap_err();
        assert!(err.is_shutdown());
    }

    #[test]
    fn test_directory_size_client_measures() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let metadata = OriginMetadata::new("https://example.com", PersistenceType::Default);

        let client_dir = layout.client_dir(
            PersistenceType::Default,
            &metadata.storage_origin,
            ClientType::KeyValue,
        );
        fs::create_dir_all(&client_dir).unwrap();
        fs::write(client_dir.join("records.bin"), vec![0u8; 64]).unwrap();

        let client = DirectorySizeClient::new(ClientType::KeyValue, layout);
        let info = client
            .init_origin(
                PersistenceType::Default,
                &metadata,
                &AtomicBool::new(false),
            )
            .unwrap();
        assert_eq!(info.usage, Some(64));
    }

    #[test]
    fn test_clients_registry() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let clients = Clients::new(vec![
            std::sync::Arc::new(DirectorySizeClient::new(ClientType::KeyValue, layout.clone())),
            std::sync::Arc::new(DirectorySizeClient::new(ClientType::Cache, layout)),
        ]);

        assert!(clients.get(ClientType::KeyValue).is_some());
        assert!(clients.get(ClientType::LocalStorage).is_none());
        assert_eq!(clients.iter().count(), 2);
    }
}
