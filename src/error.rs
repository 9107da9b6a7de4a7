//! Bibsync Error Types

use thiserror::Error;

use crate::entry::BibEntry;

/// Result type alias for bibsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bibsync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Connection errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed {
        address: String,
        /// Backend-reported error code. Codes are not comparable across
        /// backends (some report 0 for every failure), so treat as opaque.
        code: Option<String>,
        reason: String,
    },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("No shared database is currently open")]
    NotConnected,

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Shared database structure is corrupt: {0}")]
    SchemaIntegrity(String),

    // Synchronization errors
    #[error("Local entry data is not up to date with the shared database")]
    OfflineLock {
        local: Box<BibEntry>,
        shared: Box<BibEntry>,
    },

    #[error("Entry is not present on the shared database")]
    EntryNotPresent { entry: Box<BibEntry> },

    // Metadata errors
    #[error("Metadata could not be parsed: {0}")]
    MetadataParse(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error represents a recoverable synchronization conflict
    /// that needs a caller decision rather than an aborted operation
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::OfflineLock { .. } | Error::EntryNotPresent { .. }
        )
    }

    /// Check if this error indicates the connection itself is unusable
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let entry = BibEntry::new("article");
        let err = Error::EntryNotPresent {
            entry: Box::new(entry.clone()),
        };
        assert!(err.is_conflict());
        assert!(!err.is_connection_failure());

        let err = Error::OfflineLock {
            local: Box::new(entry.clone()),
            shared: Box::new(entry),
        };
        assert!(err.is_conflict());

        let err = Error::ConnectionTimeout("localhost:5432".to_string());
        assert!(!err.is_conflict());
        assert!(err.is_connection_failure());
    }
}
