//! Error types for the telemetry environment abstraction.

use thiserror::Error;

/// Errors that can occur at the I/O boundary (caches, frame sources, clocks).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// Cache read/write failed (backend closed, disk error, etc.)
    #[error("Cache error: {0}")]
    CacheError(String),
    
    /// Value serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
    
    /// An injected frame source or preload failed
    #[error("Source error: {0}")]
    SourceError(String),
    
    /// The request was abandoned through its cancel token
    #[error("Cancelled")]
    Cancelled,
    
    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a cache error.
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::CacheError(msg.into())
    }
    
    /// Creates a source error.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::SourceError(msg.into())
    }
    
    /// Creates a serialization error.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::SerializationError(err.to_string())
    }
    
    /// True for the cancellation class, which callers treat as silent abandonment.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<sled::Error> for EnvError {
    fn from(err: sled::Error) -> Self {
        Self::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_cancelled_classification() {
        assert!(EnvError::Cancelled.is_cancelled());
        assert!(!EnvError::source("boom").is_cancelled());
        assert!(!EnvError::Timeout(10).is_cancelled());
    }
    
    #[test]
    fn test_error_display() {
        assert_eq!(EnvError::cache("closed").to_string(), "Cache error: closed");
        assert_eq!(EnvError::Timeout(250).to_string(), "Timeout after 250ms");
    }
}
