//! Centralized error types for thinkchat.
//!
//! Uses thiserror for ergonomic error handling with context. Capacity
//! overflow and degenerate statistics are handled in place (truncation,
//! epsilon floors) and never surface here.

use std::path::Path;

use thiserror::Error;

/// Main error type for thinkchat operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ThinkChatError {
    /// Encode/decode/generate attempted before a model was trained or loaded.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// A persisted file was absent on load.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Invalid or unknown configuration option.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by the subword tokenizer collaborator.
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, ThinkChatError>;

impl ThinkChatError {
    /// Build a `NotInitialized` error for the named component.
    pub fn not_initialized(what: impl Into<String>) -> Self {
        ThinkChatError::NotInitialized(what.into())
    }

    /// Build a `NotFound` error for a path.
    pub fn not_found<P: AsRef<Path>>(path: P) -> Self {
        ThinkChatError::NotFound {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Check if error is recoverable (caller may retry the operation).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ThinkChatError::Io(_))
    }

    /// Check if error indicates a missing load/train call.
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, ThinkChatError::NotInitialized(_))
    }
}

/// Fail with `NotFound` unless `path` exists.
pub fn require_file<P: AsRef<Path>>(path: P) -> Result<()> {
    if path.as_ref().exists() {
        Ok(())
    } else {
        Err(ThinkChatError::not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ThinkChatError::not_initialized("tokenizer");
        assert!(err.to_string().contains("Not initialized"));
        assert!(err.is_not_initialized());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_not_found_carries_path() {
        let err = ThinkChatError::not_found("/tmp/missing/config.json");
        match err {
            ThinkChatError::NotFound { path } => assert_eq!(path, "/tmp/missing/config.json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_io_recoverable() {
        let err: ThinkChatError =
            std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted").into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_require_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            require_file(&missing),
            Err(ThinkChatError::NotFound { .. })
        ));
        std::fs::write(&missing, "{}").unwrap();
        assert!(require_file(&missing).is_ok());
    }
}
