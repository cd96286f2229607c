//! Error types for whyrender-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for whyrender-core
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Building the field metadata for a component type failed
    #[error("failed to build field metadata for {type_name}: {reason}")]
    MetadataBuild { type_name: String, reason: String },

    /// A field value could not be compared
    #[error("comparison error: {0}")]
    Comparison(#[from] ComparisonError),

    /// Object pool misuse
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A render event sink rejected an event
    #[error("sink {sink} failed: {reason}")]
    Sink { sink: String, reason: String },

    /// A background maintenance pass failed
    #[error("maintenance task {task} failed: {reason}")]
    Maintenance { task: String, reason: String },

    /// I/O errors (config loading, JSON sinks)
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(String),
}

impl Error {
    /// Whether repeating the same call later may succeed.
    ///
    /// Metadata builds are never cached on failure, so they are always
    /// retryable. Config errors need a different config.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MetadataBuild { .. }
            | Self::Sink { .. }
            | Self::Maintenance { .. }
            | Self::Io(_) => true,
            Self::Comparison(_) | Self::Pool(_) | Self::Config(_) | Self::Json(_) => false,
        }
    }

    pub(crate) fn metadata(type_name: &str, reason: impl Into<String>) -> Self {
        Self::MetadataBuild {
            type_name: type_name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// A custom comparer could not decide whether two values are equal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComparisonError {
    #[error("cannot compare {left} with {right}")]
    Incompatible { left: String, right: String },

    #[error("comparer for {type_name} failed: {reason}")]
    Comparer { type_name: String, reason: String },
}

/// Object pool misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The lease was already returned, or never issued by this pool
    #[error("lease {0} is not outstanding (double return?)")]
    UnknownLease(u64),
}

/// Configuration validation and loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be a finite positive number, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("invalid filter pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(ConfigError::Parse(err.to_string()))
    }
}
