//! Error types for evalgate-ledger

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the ledger persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing the artifact failed
    #[error("ledger io failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The artifact could not be (de)serialized
    #[error("ledger serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The artifact was written by an incompatible schema
    #[error("unsupported ledger schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    /// The artifact violates a ledger invariant
    #[error("ledger artifact is corrupt: {0}")]
    Corrupt(String),

    /// Backend-specific failure (used by fakes for failure injection)
    #[error("ledger backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for ledger operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_error_display() {
        let err = StoreError::SchemaVersion {
            found: 7,
            expected: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("expected 1"));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = StoreError::io(
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/state.json"));
    }
}
