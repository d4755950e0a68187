use std::path::{Path, PathBuf};

use crate::types::StoreError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No database file at the given path.
    #[error("database not found: {0}")]
    MissingDatabase(PathBuf),
    /// Another process holds the database file lock.
    #[error("database is open in another process: {0}")]
    InUse(PathBuf),
    /// Nothing in the file survived verification.
    #[error("no intact commit in {0}")]
    Unrecoverable(PathBuf),
    /// Engine error.
    #[error(transparent)]
    Core(#[from] StoreError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_database(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDatabase(path.as_ref().to_path_buf())
    }
}
