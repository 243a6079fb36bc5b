// error.rs — Error types for the audit subsystem.

use thiserror::Error;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to serialize an entry for hashing or transport.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The retained window's hash chain is broken — an entry was
    /// modified, inserted, or removed after append.
    #[error("integrity check failed at entry {index}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        index: usize,
        expected: String,
        actual: String,
    },
}
