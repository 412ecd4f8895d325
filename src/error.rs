//! Error types for press-counter

use thiserror::Error;

use crate::client::ClientError;

/// Main error type for the press-counter library
#[derive(Error, Debug)]
pub enum Error {
    /// Durable log (SQLite) error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Collector/API error
    #[error("collector error: {0}")]
    Client(#[from] ClientError),

    /// A blocking storage task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias for press-counter
pub type Result<T> = std::result::Result<T, Error>;
