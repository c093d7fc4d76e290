//! Error types for facetgraph-memory

use thiserror::Error;

/// Errors that can occur in the memory engine
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Request rejected before reaching any backend (bad facet, bad config, bad argument)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Vector length does not match the registered dimensionality of its facet
    #[error("Dimension mismatch for facet '{facet}': expected {expected}, got {actual}")]
    DimensionMismatch {
        facet: String,
        expected: usize,
        actual: usize,
    },

    /// Referenced node or edge is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient storage or network failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Optimistic version check failed
    #[error("Version conflict on {id}: expected v{expected}, found v{found}")]
    Conflict { id: String, expected: u64, found: u64 },

    /// A per-node write failed part way through the node/edge/vector layers
    #[error("Partial write for node {}: {}{}", .id, .reason, quarantine_suffix(.quarantined))]
    PartialWrite {
        id: String,
        reason: String,
        quarantined: bool,
    },

    /// Operation ran past its deadline
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// MessagePack encode error
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decode error
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a dimension mismatch error
    pub fn dimension_mismatch(facet: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            facet: facet.into(),
            expected,
            actual,
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a backend unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a version conflict error
    pub fn conflict(id: impl Into<String>, expected: u64, found: u64) -> Self {
        Self::Conflict {
            id: id.into(),
            expected,
            found,
        }
    }

    /// Create a partial write error
    pub fn partial_write(id: impl Into<String>, reason: impl Into<String>, quarantined: bool) -> Self {
        Self::PartialWrite {
            id: id.into(),
            reason: reason.into(),
            quarantined,
        }
    }

    /// Create an embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the error is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout { .. })
    }

    /// Whether the request was rejected before touching storage
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::DimensionMismatch { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

fn quarantine_suffix(quarantined: &bool) -> &'static str {
    if *quarantined {
        " (node quarantined)"
    } else {
        ""
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_display() {
        let err = MemoryError::dimension_mismatch("role", 4, 3);
        assert_eq!(
            err.to_string(),
            "Dimension mismatch for facet 'role': expected 4, got 3"
        );
        assert!(err.is_validation());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_partial_write_display() {
        let err = MemoryError::partial_write("n1", "edge write failed", true);
        assert_eq!(
            err.to_string(),
            "Partial write for node n1: edge write failed (node quarantined)"
        );
        let err = MemoryError::partial_write("n1", "edge write failed", false);
        assert_eq!(err.to_string(), "Partial write for node n1: edge write failed");
    }

    #[test]
    fn test_classification() {
        assert!(MemoryError::unavailable("down").is_transient());
        assert!(MemoryError::Timeout { duration_ms: 5 }.is_transient());
        assert!(MemoryError::conflict("n1", 1, 2).is_conflict());
        assert!(!MemoryError::not_found("n1").is_transient());
        assert!(MemoryError::validation("bad").is_validation());
    }
}
