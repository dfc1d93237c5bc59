//! Error types for the herald-list crate.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors from opening, locking, or saving a mailing list.
#[derive(Debug, Error)]
pub enum ListError {
    /// No list with this name exists in the store.
    #[error("No such list: {0}")]
    UnknownList(String),

    /// A list with this name already exists in the store.
    #[error("List already exists: {0}")]
    AlreadyExists(String),

    /// The name cannot be used as a list directory.
    #[error("Invalid list name: {0:?}")]
    InvalidName(String),

    /// A mutation was attempted without holding the list lock.
    #[error("List {0} must be locked before it can be changed")]
    NotLocked(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted list state is not valid.
    #[error("Corrupt state for list {list}: {source}")]
    Corrupt {
        list: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors acquiring the advisory list lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Somebody else held the lock for the whole of the wait.
    #[error("Timed out after {waited:?} waiting for the lock on {list}")]
    Timeout { list: String, waited: Duration },

    /// The lock file was broken or replaced by another process while held.
    #[error("Lock at {} is no longer held", .0.display())]
    Lost(PathBuf),

    #[error("I/O error on lock file: {0}")]
    Io(#[from] io::Error),
}

impl ListError {
    /// Whether this is a lock timeout, the one list error that callers are
    /// expected to handle by trying again later.
    pub const fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Lock(LockError::Timeout { .. }))
    }
}

pub type Result<T> = std::result::Result<T, ListError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_detection() {
        let err = ListError::from(LockError::Timeout {
            list: "x".to_string(),
            waited: Duration::from_millis(10),
        });
        assert!(err.is_lock_timeout());
        assert!(!ListError::UnknownList("x".to_string()).is_lock_timeout());
    }
}
