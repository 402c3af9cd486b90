use std::path::PathBuf;

use thiserror::Error;

/// Library error type for picture-frame operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The picture root is missing, unmounted or not a directory.
    #[error("picture library unavailable: {}", .0.display())]
    LibraryUnavailable(PathBuf),

    /// The cache file was written by a newer build.
    #[error("metadata store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// Underlying SQLite error.
    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    /// The store connection mutex was poisoned by a panicking writer.
    #[error("metadata store lock poisoned")]
    StorePoisoned,

    /// Attribute blob could not be encoded for storage.
    #[error(transparent)]
    Encode(#[from] serde_json::Error),

    /// Paths are stored as text; this one cannot be.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// A blocking scan pass panicked or was aborted.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
