//! Warren kernel: shell composition and extension-loading runtime.
//!
//! The kernel turns a site folder full of extension artifacts into running
//! per-tenant shells. Extensions are discovered by manifest, loaded through
//! an ordered loader chain, composed into a blueprint according to each
//! tenant's descriptor, and instantiated inside an isolated service
//! container. Everything expensive along the way is memoized through the
//! volatile-token cache framework, so a change on disk invalidates exactly
//! the derived state that depended on it.

pub mod caching;
pub mod composition;
pub mod container;
pub mod error;
pub mod extensions;
pub mod folder;
pub mod shell;

pub use error::{KernelError, Result};
pub use folder::SiteFolder;

pub use caching::{CacheHolder, CacheManager, ParallelCacheContext, TokenSink};
pub use composition::{CompositionProvider, CompositionStrategy, ShellBlueprint};
pub use container::{ShellContainerFactory, ShellScope, WorkScope};
pub use extensions::{
    BuiltinModules, ExtensionLoader, ExtensionLoaderCoordinator, ExtensionManager,
    PrecompiledExtensionLoader, ReferencedExtensionLoader,
};
pub use shell::{
    KernelServices, MAX_COMPOSE_PASSES, Shell, ShellContext, ShellContextFactory, ShellDescriptor,
    ShellDescriptorManager, ShellSettings, ShellSettingsManager, TenantState,
};
