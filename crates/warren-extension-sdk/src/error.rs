//! Registration and resolution error types.

use thiserror::Error;

/// Errors raised while registering capabilities or constructing components.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A component full name was registered twice within one registry.
    #[error("duplicate component registration: {0}")]
    Duplicate(String),

    /// A factory could not resolve one of its dependencies.
    #[error("missing service: {0}")]
    MissingService(String),

    /// A resolved service payload did not have the expected type.
    #[error("service type mismatch for key: {0}")]
    TypeMismatch(String),

    /// A component factory failed.
    #[error("component factory failed: {0}")]
    Factory(String),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
