//! Warren host: configuration and the multi-tenant runtime behind `warrend`.

pub mod config;
pub mod runtime;

pub use config::{HostConfig, KNOWN_DATA_PROVIDERS, SITE_ROOT_ENV};
pub use runtime::{TenantStatus, WarrenHost};
