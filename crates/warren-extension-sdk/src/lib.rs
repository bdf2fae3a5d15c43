//! Warren Extension SDK
//!
//! The module-author surface of the Warren multi-tenant host. A module,
//! whether compiled into the host or shipped as a cdylib, declares what it
//! provides by registering components into a [`CapabilityRegistry`]: no
//! reflection, no type scanning. Each registration names its owning feature,
//! carries an explicit [`Lifetime`] tag, and exposes the component under one
//! or more [`ServiceKey`]s that other components resolve through a
//! [`Resolver`].
//!
//! # Quick start
//!
//! ```rust
//! use warren_extension_sdk::prelude::*;
//!
//! fn configure(registry: &mut CapabilityRegistry) -> RegistryResult<()> {
//!     registry
//!         .feature("blog")
//!         .component("blog.PostService")
//!         .lifetime(Lifetime::Singleton)
//!         .expose("blog.posts")
//!         .with_factory(|_resolver| Ok(service(String::from("posts"))))
//! }
//!
//! // In a cdylib module crate:
//! export_module!(configure);
//! ```

pub mod error;
#[macro_use]
pub mod macros;
pub mod registry;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::{
    CapabilityRegistry, CapabilitySet, ComponentBuilder, ComponentFactory, ComponentRegistration,
    ContainerModule, FeatureRegistrar, module_service,
};
pub use types::{
    ABI_VERSION, ABI_VERSION_SYMBOL, CAPABILITIES_SYMBOL, ComponentKind, Lifetime, Resolver,
    ServiceKey, SharedService, require, resolve_as, service,
};

/// Prelude with the imports a module crate needs.
pub mod prelude {
    pub use crate::error::{RegistryError, RegistryResult};
    pub use crate::registry::{
        CapabilityRegistry, CapabilitySet, ComponentRegistration, ContainerModule, module_service,
    };
    pub use crate::types::{
        ABI_VERSION, ComponentKind, Lifetime, Resolver, ServiceKey, SharedService, require,
        resolve_as, service,
    };
    // Macros are exported at the crate root via #[macro_export].
    pub use crate::export_module;
}
