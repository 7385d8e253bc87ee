//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Every variant except [`CacheError::Missing`] means the cache is unusable
/// for the request, as opposed to simply not holding the entry yet. Use
/// [`CacheError::kind`] to branch on the category.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing local cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The requested entry exists in no configured tier.
    ///
    /// This is kept apart from [`CacheError::Corruption`] even when the
    /// caller expected the entry to exist: an entry absent from every tier
    /// usually means the producing node has not run or pushed yet, which a
    /// scheduler handles by running it, while corruption means stored state
    /// is broken and needs attention. Both are fatal to the call.
    #[error("cache miss: no {what} for {key} in any tier")]
    Missing {
        /// What was looked up (output manifest, tag file list).
        what: &'static str,
        /// The node/output or node/tag key.
        key: String,
    },

    /// A stored manifest, tag list, or container is unreadable or inconsistent.
    #[error("cache corruption at {path}: {reason}")]
    Corruption {
        /// The offending file.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// Files on disk do not match the manifest that describes them.
    #[error("integrity mismatch for {block}: {}", details.join("; "))]
    IntegrityMismatch {
        /// The output block being verified.
        block: String,
        /// One message per failing file.
        details: Vec<String>,
    },

    /// Writing into the shared tier failed.
    #[error("failed to write shared storage at {path}: {source}")]
    StorageWrite {
        /// The shared-tier path being written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A container could not be created, opened, read, or extracted.
    #[error("archive failure at {path}: {reason}")]
    Archive {
        /// The container path.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// A build product does not lie under the build root.
    #[error("{path} is outside the build root {root}")]
    OutsideRoot {
        /// The offending file.
        path: PathBuf,
        /// The configured build root.
        root: PathBuf,
    },

    /// A node, output, or tag name cannot be used as a path segment.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A manifest or tag list could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

/// Coarse category of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entry does not exist yet.
    NotFound,
    /// Stored cache state is broken.
    Corruption,
    /// Restored or local files do not match their manifest.
    Integrity,
    /// The shared tier rejected a write.
    StorageWrite,
    /// Compression or extraction failed.
    Archive,
    /// The caller passed an unusable path or name.
    InvalidInput,
    /// Any other I/O or serialization failure.
    Io,
}

impl CacheError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Missing { .. } => ErrorKind::NotFound,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::IntegrityMismatch { .. } => ErrorKind::Integrity,
            Self::StorageWrite { .. } => ErrorKind::StorageWrite,
            Self::Archive { .. } => ErrorKind::Archive,
            Self::OutsideRoot { .. } | Self::InvalidName { .. } => ErrorKind::InvalidInput,
            Self::Io { .. } | Self::Serialization { .. } => ErrorKind::Io,
        }
    }

    /// Returns `true` if the entry simply has not been stored yet.
    pub fn is_miss(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Archive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
