//! Error types for Quotastore
//!
//! One taxonomy is shared by every crate: corruption is recovered from by
//! deleting and recreating the smallest enclosing unit, not-found during
//! best-effort scans means "nothing to do", a future-versioned schema is
//! fatal to initialization, and shutdown produces a rejection kind of its
//! own so callers can tell teardown from real failure.

use thiserror::Error;

/// Common result type for Quotastore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Quotastore
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {unit}: {detail}")]
    Corruption { unit: String, detail: String },

    #[error("not found")]
    NotFound,

    #[error("storage version {found:#010x} too new: this build supports {supported:#010x}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("no migration path from storage version {from:#010x}")]
    NoMigrationPath { from: u32 },

    #[error("operation aborted by shutdown")]
    ShutdownAborted,

    #[error("invalid origin string: {0}")]
    InvalidOrigin(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("internal error: {0}")]
    Internal(String),

    // Database errors
    #[error("database error: {0}")]
    Database(Box<redb::DatabaseError>),

    #[error("database storage error: {0}")]
    DbStorage(#[from] redb::StorageError),

    #[error("database table error: {0}")]
    DbTable(#[from] redb::TableError),

    #[error("database transaction error: {0}")]
    DbTransaction(Box<redb::TransactionError>),

    #[error("database commit error: {0}")]
    DbCommit(#[from] redb::CommitError),

    #[error("row encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::DbTransaction(Box::new(e))
    }
}

impl Error {
    /// Create a corruption error for a named on-disk unit.
    pub fn corruption(unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corruption {
            unit: unit.into(),
            detail: detail.into(),
        }
    }

    /// Create a bad parameter error
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Produce an equivalent error for fanning one failure out to
    /// several waiters. Variants wrapping non-clonable sources collapse
    /// into [`Error::Internal`] with the rendered message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Corruption { unit, detail } => Self::Corruption {
                unit: unit.clone(),
                detail: detail.clone(),
            },
            Self::NotFound => Self::NotFound,
            Self::VersionTooNew { found, supported } => Self::VersionTooNew {
                found: *found,
                supported: *supported,
            },
            Self::NoMigrationPath { from } => Self::NoMigrationPath { from: *from },
            Self::ShutdownAborted => Self::ShutdownAborted,
            Self::InvalidOrigin(s) => Self::InvalidOrigin(s.clone()),
            Self::BadParameter(s) => Self::BadParameter(s.clone()),
            Self::Internal(s) => Self::Internal(s.clone()),
            other => Self::Internal(other.to_string()),
        }
    }

    /// Check if this is a not found error (including I/O not-found)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this is a shutdown rejection
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutdownAborted)
    }

    /// Check if this is detected on-disk corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::InvalidData)
    }
}

/// Render a `(major << 16) | minor` storage version for messages.
#[must_use]
pub fn format_version(version: u32) -> String {
    format!("{}.{}", version >> 16, version & 0xFFFF)
}

/// Downgrade a benign not-found error to success. Used by cleanup paths
/// where concurrent external deletion is expected.
pub fn ok_if_not_found<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

/// Terminate the process over a broken accounting or lock-state
/// invariant. Continuing would mean operating on unreliable counters.
pub fn fatal_invariant(msg: &str) -> ! {
    tracing::error!("fatal invariant violation: {msg}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound.is_not_found());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).is_not_found()
        );
        assert!(!Error::ShutdownAborted.is_not_found());
    }

    #[test]
    fn test_error_shutdown() {
        assert!(Error::ShutdownAborted.is_shutdown());
        assert!(!Error::NotFound.is_shutdown());
    }

    #[test]
    fn test_ok_if_not_found() {
        let r: Result<u64> = ok_if_not_found(Err(Error::NotFound));
        assert_eq!(r.unwrap(), 0);

        let r: Result<u64> = ok_if_not_found(Err(Error::ShutdownAborted));
        assert!(r.is_err());
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version((2 << 16) | 3), "2.3");
        assert_eq!(format_version(0), "0.0");
    }
}
