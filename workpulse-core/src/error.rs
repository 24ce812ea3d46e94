//! Error types for workpulse-core

use thiserror::Error;

/// Main error type for the workpulse-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Logging setup error
    #[error("logging error: {0}")]
    Logging(String),

    /// Store written by an incompatible version
    #[error("incompatible schema: {0}")]
    Schema(String),

    /// Interval failed construction validation
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Index into a pending list or review page was out of range
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Operation not valid in the current engine state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Committing reviewed edits to the store failed
    #[error("failed to commit reviewed intervals: {0}")]
    Commit(String),
}

/// Result type alias for workpulse-core
pub type Result<T> = std::result::Result<T, Error>;
