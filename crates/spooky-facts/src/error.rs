//! Error types for spooky-facts

use spooky_exec::ExecError;
use thiserror::Error;

/// Errors that can occur during fact storage, import or collection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactError {
    /// Fact store I/O failure or corruption
    #[error("storage error: {0}")]
    Storage(String),

    /// Store used after `close`
    #[error("storage error: fact store is closed")]
    Closed,

    /// Import data is not valid JSON
    #[error("parse error: {0}")]
    Parse(String),

    /// Import data is JSON but a record is invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// Query text could not be parsed
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Import source uses a disallowed scheme
    #[error("unsupported import source: {0}")]
    UnsupportedSource(String),

    /// Remote import failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Collection target is neither `local` nor an inventory machine
    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    /// Channel to the collection target could not be opened
    #[error("channel error: {0}")]
    Channel(#[from] ExecError),

    /// Local file I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Collection abandoned before it started
    #[error("cancelled")]
    Cancelled,
}

impl FactError {
    /// True for store failures, which are fatal for the calling operation
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, FactError::Storage(_) | FactError::Closed)
    }
}

impl From<redb::Error> for FactError {
    fn from(e: redb::Error) -> Self {
        FactError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for FactError {
    fn from(e: std::io::Error) -> Self {
        FactError::Io(e.to_string())
    }
}

/// Convert any redb error into `FactError::Storage`
pub(crate) fn storage(e: impl Into<redb::Error>) -> FactError {
    FactError::from(e.into())
}
