//! Referenced loader: serves modules statically built into the host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use warren_extension_sdk::{CapabilityRegistry, CapabilitySet, RegistryResult};

use crate::error::{KernelError, Result};
use crate::extensions::loading::{ActivationRecord, ExtensionLoadingContext};
use crate::extensions::manifest::ExtensionDescriptor;

use super::{ExtensionLoader, ExtensionProbe, LoadedExtension, REFERENCED_ORDER};

/// Loader name recorded in probes and activation records.
pub const REFERENCED_LOADER: &str = "referenced";

/// Registers capabilities for a module compiled into the host binary.
pub trait BuiltinCapabilityProvider: Send + Sync {
    fn register(&self, registry: &mut CapabilityRegistry) -> RegistryResult<()>;
}

impl<F> BuiltinCapabilityProvider for F
where
    F: Fn(&mut CapabilityRegistry) -> RegistryResult<()> + Send + Sync,
{
    fn register(&self, registry: &mut CapabilityRegistry) -> RegistryResult<()> {
        self(registry)
    }
}

/// Registry of builtin capability providers, populated by the host at
/// startup before any shell is composed.
#[derive(Default)]
pub struct BuiltinModules {
    providers: RwLock<HashMap<String, Arc<dyn BuiltinCapabilityProvider>>>,
}

impl BuiltinModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        extension_id: impl Into<String>,
        provider: Arc<dyn BuiltinCapabilityProvider>,
    ) {
        self.providers.write().insert(extension_id.into(), provider);
    }

    pub fn contains(&self, extension_id: &str) -> bool {
        self.providers.read().contains_key(extension_id)
    }

    fn capabilities(&self, extension_id: &str) -> Option<RegistryResult<CapabilitySet>> {
        let provider = self.providers.read().get(extension_id).cloned()?;
        let mut registry = CapabilityRegistry::new();
        Some(provider.register(&mut registry).map(|()| registry.into_set()))
    }
}

/// The order-20 loader serving builtin modules. Monitors nothing: builtins
/// only change with the host binary.
pub struct ReferencedExtensionLoader {
    builtins: Arc<BuiltinModules>,
}

impl ReferencedExtensionLoader {
    pub fn new(builtins: Arc<BuiltinModules>) -> Self {
        Self { builtins }
    }
}

impl ExtensionLoader for ReferencedExtensionLoader {
    fn name(&self) -> &'static str {
        REFERENCED_LOADER
    }

    fn order(&self) -> u32 {
        REFERENCED_ORDER
    }

    fn probe(&self, extension: &ExtensionDescriptor) -> Option<ExtensionProbe> {
        if !self.builtins.contains(&extension.id) {
            return None;
        }
        Some(ExtensionProbe {
            extension_id: extension.id.clone(),
            loader: REFERENCED_LOADER,
            order: REFERENCED_ORDER,
            artifact: None,
            modified: None,
        })
    }

    fn load(&self, extension: &ExtensionDescriptor) -> Result<Option<LoadedExtension>> {
        let Some(capabilities) = self.builtins.capabilities(&extension.id) else {
            return Ok(None);
        };
        let capabilities = capabilities.map_err(KernelError::Registry)?;
        tracing::debug!(
            extension_id = %extension.id,
            components = capabilities.len(),
            "loaded builtin extension"
        );
        Ok(Some(LoadedExtension {
            extension_id: extension.id.clone(),
            loader: REFERENCED_LOADER,
            capabilities,
        }))
    }

    fn extension_activated(
        &self,
        _ctx: &mut ExtensionLoadingContext,
        extension: &ExtensionDescriptor,
        _probe: &ExtensionProbe,
        _prior: Option<&ActivationRecord>,
    ) -> Result<Option<ActivationRecord>> {
        Ok(Some(ActivationRecord::builtin(
            &extension.id,
            REFERENCED_LOADER,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::manifest::{ExtensionKind, parse_manifest};
    use std::path::Path;
    use warren_extension_sdk::service;

    fn blog_descriptor() -> ExtensionDescriptor {
        parse_manifest(
            ExtensionKind::Module,
            Path::new("modules/blog"),
            "id = \"blog\"\nversion = \"1.0.0\"",
        )
        .unwrap()
    }

    fn builtins_with_blog() -> Arc<BuiltinModules> {
        let builtins = Arc::new(BuiltinModules::new());
        builtins.register(
            "blog",
            Arc::new(|registry: &mut CapabilityRegistry| {
                registry
                    .feature("blog")
                    .component("blog.PostService")
                    .expose("blog.posts")
                    .with_factory(|_| Ok(service(1u8)))
            }),
        );
        builtins
    }

    #[test]
    fn test_probe_claims_only_registered_ids() {
        let loader = ReferencedExtensionLoader::new(builtins_with_blog());
        assert!(loader.probe(&blog_descriptor()).is_some());

        let other = parse_manifest(
            ExtensionKind::Module,
            Path::new("modules/shop"),
            "id = \"shop\"\nversion = \"1.0.0\"",
        )
        .unwrap();
        assert!(loader.probe(&other).is_none());
    }

    #[test]
    fn test_load_returns_provider_capabilities() {
        let loader = ReferencedExtensionLoader::new(builtins_with_blog());
        let loaded = loader.load(&blog_descriptor()).unwrap().unwrap();
        assert_eq!(loaded.loader, REFERENCED_LOADER);
        assert_eq!(loaded.capabilities.len(), 1);
    }
}
