//! Core types shared between the host kernel and extension modules.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// ABI version of the module export protocol. Bumped whenever the layout of
/// [`crate::registry::CapabilitySet`] or the export symbols change; the host
/// refuses to load a module built against a different version.
pub const ABI_VERSION: u32 = 1;

/// Symbol name of the ABI-version export emitted by [`crate::export_module!`].
pub const ABI_VERSION_SYMBOL: &str = "warren_module_abi_version";

/// Symbol name of the capability export emitted by [`crate::export_module!`].
pub const CAPABILITIES_SYMBOL: &str = "warren_module_capabilities";

/// How long a component instance lives inside a shell container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifetime {
    /// One instance per shell scope, created lazily and cached.
    Singleton,
    /// One instance per work scope.
    WorkUnit,
    /// A fresh instance on every resolve.
    Transient,
}

/// What role a registered component plays during composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// A composition module: instantiated early, may contribute further
    /// registrations through [`crate::registry::ContainerModule::configure`].
    Module,
    /// A plain dependency registered into the shell scope.
    Dependency,
}

/// Key under which a service is exposed inside a shell container.
///
/// Keys live only in process memory; persisted records store plain strings.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey(Arc<str>);

impl ServiceKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceKey({})", self.0)
    }
}

impl From<&str> for ServiceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ServiceKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// Type-erased service payload stored in a container. Typically wraps an
/// `Arc<dyn Trait>` produced by [`service`].
pub type SharedService = Arc<dyn Any + Send + Sync>;

/// Wrap a service value for storage in a container.
///
/// The value is recovered with the same concrete type through
/// [`resolve_as`], so trait-object services should be passed as an already
/// coerced `Arc<dyn Trait>`.
pub fn service<T: Send + Sync + 'static>(value: T) -> SharedService {
    Arc::new(value)
}

/// Anything a component factory can resolve other services from.
pub trait Resolver: Send + Sync {
    /// Resolve the raw payload registered under `key`, or `None` when nothing
    /// is registered (or the registered factory failed).
    fn resolve_raw(&self, key: &ServiceKey) -> Option<SharedService>;
}

/// Resolve a service and downcast it to the type it was stored with.
pub fn resolve_as<T: Clone + 'static>(resolver: &dyn Resolver, key: &ServiceKey) -> Option<T> {
    resolver
        .resolve_raw(key)
        .and_then(|payload| payload.downcast_ref::<T>().cloned())
}

/// Like [`resolve_as`] but for factories: missing keys and type mismatches
/// become [`RegistryError`]s instead of `None`.
pub fn require<T: Clone + 'static>(
    resolver: &dyn Resolver,
    key: &ServiceKey,
) -> RegistryResult<T> {
    let payload = resolver
        .resolve_raw(key)
        .ok_or_else(|| RegistryError::MissingService(key.to_string()))?;
    payload
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch(key.to_string()))
}
