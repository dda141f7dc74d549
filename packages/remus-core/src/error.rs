//! Error types for the community node core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the core crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The store file exists but is not a database we can open or salvage.
    #[error("Invalid database: {0}")]
    InvalidDatabase(String),

    /// Underlying SQLite failure.
    #[error("Database error: {0}")]
    Database(String),

    /// The requested entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The operation would violate a state invariant
    /// (e.g. deleting the `@everyone` role).
    #[error("{0}")]
    Conflict(String),

    /// JSON (de)serialization failure for a stored column or legacy export.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure during store bring-up.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
