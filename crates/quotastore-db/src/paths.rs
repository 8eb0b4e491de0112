//! Storage tree layout
//!
//! ```text
//! <root>/
//!   storage.db                     top-level database (schema + usage cache)
//!   storage/
//!     permanent/<origin>/<client>/ persistent repository (never tracked)
//!     temporary/<origin>/<client>/
//!     default/<origin>/<client>/
//!     private/<origin>/<client>/
//!     to-be-removed/               staging area for failed deletions
//! ```

use crate::sanitize::sanitize_origin;
use quotastore_common::{ClientType, PersistenceType};
use std::path::{Path, PathBuf};

/// Name of the storage directory under the root.
pub const STORAGE_DIRECTORY_NAME: &str = "storage";

/// Name of the top-level database file under the root.
pub const DATABASE_FILE_NAME: &str = "storage.db";

/// Staging directory for origin directories that could not be removed
/// in place; swept during initialization.
pub const TO_BE_REMOVED_DIRECTORY_NAME: &str = "to-be-removed";

/// Name of the per-origin binary metadata record.
pub const METADATA_FILE_NAME: &str = ".metadata-v2";

/// Temporary name the metadata record is written under before rename.
pub const METADATA_TMP_FILE_NAME: &str = ".metadata-v2.tmp";

/// Resolves the fixed locations of the storage tree for one root.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/storage.db`
    #[must_use]
    pub fn database_file(&self) -> PathBuf {
        self.root.join(DATABASE_FILE_NAME)
    }

    /// `<root>/storage`
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.root.join(STORAGE_DIRECTORY_NAME)
    }

    /// `<root>/storage/<repository>`
    #[must_use]
    pub fn repository_dir(&self, persistence_type: PersistenceType) -> PathBuf {
        self.storage_dir().join(persistence_type.directory_name())
    }

    /// `<root>/storage/to-be-removed`
    #[must_use]
    pub fn to_be_removed_dir(&self) -> PathBuf {
        self.storage_dir().join(TO_BE_REMOVED_DIRECTORY_NAME)
    }

    /// `<root>/storage/<repository>/<sanitized-origin>`
    #[must_use]
    pub fn origin_dir(&self, persistence_type: PersistenceType, storage_origin: &str) -> PathBuf {
        self.repository_dir(persistence_type)
            .join(sanitize_origin(storage_origin))
    }

    /// `<root>/storage/<repository>/<sanitized-origin>/<client>`
    #[must_use]
    pub fn client_dir(
        &self,
        persistence_type: PersistenceType,
        storage_origin: &str,
        client_type: ClientType,
    ) -> PathBuf {
        self.origin_dir(persistence_type, storage_origin)
            .join(client_type.directory_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data");
        assert_eq!(layout.database_file(), PathBuf::from("/data/storage.db"));
        assert_eq!(
            layout.repository_dir(PersistenceType::Persistent),
            PathBuf::from("/data/storage/permanent")
        );
        assert_eq!(
            layout.client_dir(
                PersistenceType::Default,
                "https://example.com",
                ClientType::KeyValue
            ),
            PathBuf::from("/data/storage/default/https+++example.com/kv")
        );
    }
}
