//! Kernel error types.
//!
//! The taxonomy the host relies on: [`KernelError::Configuration`] is
//! non-fatal per tenant (skip with a warning), composition and loader errors
//! abort that tenant's shell creation, and environment changes never surface
//! here at all; they set the restart flag on the loading context instead.

use std::path::PathBuf;

use thiserror::Error;
use warren_extension_sdk::RegistryError;

/// Errors raised by the Warren kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An extension manifest could not be parsed.
    #[error("invalid manifest at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// A relative path escaped the site root.
    #[error("path escapes the site root: {0}")]
    PathTraversal(PathBuf),

    /// Tenant configuration is missing or ambiguous; the tenant is skipped.
    #[error("configuration error for tenant '{tenant}': {reason}")]
    Configuration { tenant: String, reason: String },

    /// Shell composition failed; the tenant's shell is not built.
    #[error("composition error: {0}")]
    Composition(String),

    /// An extension loader failed while probing or loading an artifact.
    #[error("extension loader '{loader}' failed for '{extension_id}': {reason}")]
    Loader {
        loader: &'static str,
        extension_id: String,
        reason: String,
    },

    /// A descriptor update was based on a serial that is no longer current.
    #[error("stale shell descriptor: update based on serial {prior}, current is {current}")]
    StaleDescriptor { prior: u64, current: u64 },

    /// Component registration or resolution failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Descriptor-log record (de)serialization failed.
    #[error("descriptor log encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Result alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;
