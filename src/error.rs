use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors raised by embedding configuration and coordinator management.
///
/// Configuration and initialization errors indicate a caller mistake and are
/// fatal; they are surfaced immediately rather than retried. Runtime
/// operations only propagate whatever the wrapped coordinator raises.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding coordinator has already been set")]
    AlreadyInitialized,

    #[error("invalid embedding configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("feature key '{key}' is used by multiple tables")]
    DuplicateFeature { key: String },

    #[error("invalid input keys: {invalid:?} (valid keys: {valid:?})")]
    InvalidKeys {
        invalid: Vec<String>,
        valid: Vec<String>,
    },

    #[error("shape mismatch in '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    #[error("not implemented: {details}")]
    NotImplemented { details: String },

    #[error("embedding backend error: {details}")]
    Backend { details: String },
}

impl EmbeddingError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn duplicate_feature(key: impl Into<String>) -> Self {
        Self::DuplicateFeature { key: key.into() }
    }

    pub fn shape_mismatch(operation: &str, expected: &str, got: &str) -> Self {
        Self::ShapeMismatch {
            operation: operation.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub fn not_implemented(details: impl Into<String>) -> Self {
        Self::NotImplemented {
            details: details.into(),
        }
    }

    pub fn backend(details: impl Into<String>) -> Self {
        Self::Backend {
            details: details.into(),
        }
    }
}
