//! Error types for the remote watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors reported by a [`RemoteStore`](crate::store::RemoteStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested directory or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or storage failure.
    #[error("store request failed: {0}")]
    Request(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Create a request error from any message.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request(message.into())
    }

    /// Returns true if this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Errors that can occur while polling, reconciling or mirroring.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Listing the watched directory failed for a reason other than "not found".
    #[error("failed to list {directory}: {source}")]
    Listing {
        /// Directory that was listed.
        directory: String,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The local mirror could not be read.
    #[error("failed to read mirror {}: {source}", path.display())]
    Reconciliation {
        /// Mirror path being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Fetching remote metadata during reconciliation failed.
    #[error("failed to fetch metadata for {path}: {source}")]
    Metadata {
        /// Remote object path.
        path: String,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The delete guard refused to run destructive deletions.
    #[error(
        "delete guard tripped: {deletes} mirrored file(s) in {} would be deleted but none of them \
         match a remote entry; the mirror directory is probably misconfigured \
         (disable the guard to force the deletion)",
        mirror.display()
    )]
    GuardTripped {
        /// The mirror directory.
        mirror: PathBuf,
        /// How many local files would have been removed.
        deletes: usize,
    },

    /// Materializing a change into the mirror failed.
    #[error("failed to sync {name} into {}: {source}", path.display())]
    Sync {
        /// Entry name.
        name: String,
        /// Local path being written or removed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: SyncFailure,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cause of a sync failure.
#[derive(Error, Debug)]
pub enum SyncFailure {
    /// The remote object could not be fetched.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A local filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Returns true if this is a delete guard abort.
    pub fn is_guard_tripped(&self) -> bool {
        matches!(self, WatchError::GuardTripped { .. })
    }
}
