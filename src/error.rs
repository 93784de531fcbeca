//! Error types for resource pool operations.

use crate::key::ResourceKey;
use thiserror::Error;

/// Failure reported by a driver while constructing or releasing a handle.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pool errors.
///
/// Errors are `Clone` because one construction outcome is handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The driver failed to build the handle. Nothing is cached, so the next
    /// request for the same key retries.
    #[error("construction of {key} failed: {message}")]
    ConstructionFailed { key: ResourceKey, message: String },

    /// The record has no persistent identity yet and cannot be cached.
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// Releasing a handle failed. Only ever logged by the pool itself.
    #[error("disposal of {key} failed: {message}")]
    DisposalFailed { key: ResourceKey, message: String },

    /// A handle this construction depends on cannot be resolved.
    #[error("{key} depends on missing record {dependency}")]
    MissingDependency { key: ResourceKey, dependency: String },

    /// The pool was disposed before or during the request.
    #[error("resource pool is shut down")]
    PoolShutdown,

    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    pub(crate) fn construction(key: &ResourceKey, err: DriverError) -> Self {
        Error::ConstructionFailed {
            key: key.clone(),
            message: err.to_string(),
        }
    }

    /// Whether a later attempt for the same key may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConstructionFailed { .. } | Error::MissingDependency { .. }
        )
    }
}
