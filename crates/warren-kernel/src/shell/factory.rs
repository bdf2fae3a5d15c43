//! Builds running shell contexts from tenant settings.
//!
//! Container construction is optimistic: the context is composed from the
//! cached descriptor snapshot so no container has to exist before the
//! authoritative store is consulted. Once built, the descriptor manager
//! resolved from the new container reports the authoritative descriptor; on a
//! serial mismatch the snapshot is refreshed and the context is rebuilt, at
//! most [`MAX_COMPOSE_PASSES`] times.

use std::sync::Arc;

use warren_extension_sdk::ServiceKey;

use crate::caching::TokenSink;
use crate::composition::{CompositionStrategy, ShellBlueprint};
use crate::container::{ShellContainerFactory, ShellScope};
use crate::error::{KernelError, Result};

use super::{
    KernelServices, SHELL_DESCRIPTOR_MANAGER_KEY, SHELL_KEY, Shell, ShellDescriptor,
    ShellDescriptorManager, ShellSettings,
};

/// Rebuild attempts allowed when the descriptor drifts during construction.
pub const MAX_COMPOSE_PASSES: usize = 3;

/// A tenant's running state: the blueprint it was composed from, the
/// container built from it, and the activated shell handle.
pub struct ShellContext {
    pub blueprint: ShellBlueprint,
    pub scope: Arc<ShellScope>,
    shell: Option<Arc<dyn Shell>>,
}

impl ShellContext {
    pub fn tenant(&self) -> &str {
        &self.blueprint.settings.name
    }

    pub fn descriptor(&self) -> &ShellDescriptor {
        &self.blueprint.descriptor
    }

    /// Activate the tenant's shell handle, when one is registered.
    pub fn activate(&self) {
        if let Some(shell) = &self.shell {
            shell.activate();
        }
    }

    /// Terminate the shell and tear the container down.
    pub fn dispose(&self) {
        if let Some(shell) = &self.shell {
            shell.terminate();
        }
        self.scope.dispose();
    }
}

/// Creates shell contexts: composes a blueprint, builds the container, and
/// reconciles the descriptor it was built from with the authoritative store.
pub struct ShellContextFactory {
    composition: Arc<CompositionStrategy>,
    container: Arc<ShellContainerFactory>,
    services: Arc<KernelServices>,
}

impl ShellContextFactory {
    pub fn new(
        composition: Arc<CompositionStrategy>,
        container: Arc<ShellContainerFactory>,
        services: Arc<KernelServices>,
    ) -> Self {
        Self {
            composition,
            container,
            services,
        }
    }

    /// Build the running context for a tenant.
    ///
    /// The first pass uses the cached snapshot when one exists; after each
    /// build the descriptor manager inside the new container is the
    /// authority, and a stale pass refreshes the snapshot and rebuilds.
    pub fn create_shell_context(
        &self,
        sink: &mut dyn TokenSink,
        settings: &ShellSettings,
    ) -> Result<ShellContext> {
        let mut descriptor = match self.services.descriptor_cache.fetch(&settings.name)? {
            Some(snapshot) => snapshot,
            None => self.bootstrap_descriptor(sink, settings)?,
        };

        for pass in 0..MAX_COMPOSE_PASSES {
            let context = self.create_described_context(sink, settings, &descriptor)?;
            let current = self.current_descriptor(&context)?;
            if current.serial_number == descriptor.serial_number {
                if pass > 0 {
                    tracing::info!(
                        tenant = %settings.name,
                        serial = current.serial_number,
                        passes = pass + 1,
                        "shell context settled after rebuild"
                    );
                }
                self.services.descriptor_cache.store(&settings.name, &current)?;
                return Ok(context);
            }

            tracing::info!(
                tenant = %settings.name,
                built_from = descriptor.serial_number,
                current = current.serial_number,
                "descriptor changed during construction; rebuilding"
            );
            self.services.descriptor_cache.store(&settings.name, &current)?;
            context.dispose();
            descriptor = current;
        }

        Err(KernelError::Composition(format!(
            "descriptor for tenant '{}' kept changing across {MAX_COMPOSE_PASSES} passes",
            settings.name
        )))
    }

    /// Build a context for an explicit descriptor, skipping reconciliation.
    pub fn create_described_context(
        &self,
        sink: &mut dyn TokenSink,
        settings: &ShellSettings,
        descriptor: &ShellDescriptor,
    ) -> Result<ShellContext> {
        let blueprint = self.composition.compose(sink, settings, descriptor)?;
        let scope = self.container.create_container(settings, &blueprint)?;
        let shell = scope.try_resolve::<Arc<dyn Shell>>(&ServiceKey::new(SHELL_KEY));
        Ok(ShellContext {
            blueprint,
            scope,
            shell,
        })
    }

    /// Build the transient context an uninitialized tenant runs its setup
    /// flow in. Its descriptor is the minimum feature set under serial zero
    /// and is never written to the log or the cache.
    pub fn create_setup_context(
        &self,
        sink: &mut dyn TokenSink,
        settings: &ShellSettings,
    ) -> Result<ShellContext> {
        let descriptor = ShellDescriptor::new(0, self.services.minimum_feature_names());
        self.create_described_context(sink, settings, &descriptor)
    }

    /// When no snapshot exists, ask a throwaway minimum container for the
    /// authoritative descriptor. This is where a brand-new tenant gets its
    /// first log entry.
    fn bootstrap_descriptor(
        &self,
        sink: &mut dyn TokenSink,
        settings: &ShellSettings,
    ) -> Result<ShellDescriptor> {
        let context = self.create_setup_context(sink, settings)?;
        let descriptor = self.current_descriptor(&context);
        context.dispose();
        descriptor
    }

    /// The authoritative descriptor, as reported from inside the container.
    fn current_descriptor(&self, context: &ShellContext) -> Result<ShellDescriptor> {
        let work = context.scope.create_work_scope();
        let manager: Arc<dyn ShellDescriptorManager> =
            work.resolve(&ServiceKey::new(SHELL_DESCRIPTOR_MANAGER_KEY))?;
        manager.get_shell_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::{CacheHolder, NullSink};
    use crate::composition::CompositionProvider;
    use crate::extensions::ExtensionManager;
    use crate::folder::SiteFolder;
    use crate::shell::{KERNEL_FEATURE, SETTINGS_FEATURE, ShellFeature};
    use warren_extension_sdk::{
        CapabilityRegistry, Lifetime, Resolver, service,
    };

    struct Harness {
        _dir: tempfile::TempDir,
        services: Arc<KernelServices>,
        factory: ShellContextFactory,
    }

    fn harness(providers: Vec<Arc<dyn CompositionProvider>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        let services = KernelServices::open(folder.clone()).unwrap();
        let holder = Arc::new(CacheHolder::new());
        let manager = Arc::new(ExtensionManager::new(folder, Vec::new(), holder));
        let mut composition = CompositionStrategy::new(manager);
        for provider in providers {
            composition = composition.with_provider(provider);
        }
        let container = Arc::new(ShellContainerFactory::new(services.clone()));
        let factory =
            ShellContextFactory::new(Arc::new(composition), container, services.clone());
        Harness {
            _dir: dir,
            services,
            factory,
        }
    }

    #[test]
    fn test_new_tenant_gets_minimum_descriptor_serial_one() {
        let harness = harness(Vec::new());
        let settings = ShellSettings::new("Default");

        let context = harness
            .factory
            .create_shell_context(&mut NullSink, &settings)
            .unwrap();

        assert_eq!(context.descriptor().serial_number, 1);
        assert_eq!(
            context.descriptor().feature_names(),
            vec![KERNEL_FEATURE, SETTINGS_FEATURE]
        );
        // The snapshot was refreshed for the next start.
        let cached = harness.services.descriptor_cache.fetch("Default").unwrap();
        assert_eq!(cached.unwrap().serial_number, 1);
    }

    #[test]
    fn test_stale_snapshot_triggers_one_rebuild() {
        let harness = harness(Vec::new());
        let settings = ShellSettings::new("Default");

        // The log has advanced past what the snapshot remembers.
        let stale = harness
            .services
            .descriptor_log
            .append(
                "Default",
                vec![KERNEL_FEATURE.to_string(), SETTINGS_FEATURE.to_string()],
            )
            .unwrap();
        let current = harness
            .services
            .descriptor_log
            .append(
                "Default",
                vec![KERNEL_FEATURE.to_string(), SETTINGS_FEATURE.to_string()],
            )
            .unwrap();
        harness
            .services
            .descriptor_cache
            .store("Default", &stale)
            .unwrap();

        let context = harness
            .factory
            .create_shell_context(&mut NullSink, &settings)
            .unwrap();

        assert_eq!(context.descriptor().serial_number, current.serial_number);
        let cached = harness.services.descriptor_cache.fetch("Default").unwrap();
        assert_eq!(cached.unwrap().serial_number, current.serial_number);
        // Both entries remain in the log.
        assert_eq!(harness.services.descriptor_log.history("Default").len(), 2);
    }

    #[test]
    fn test_perpetual_drift_fails_after_bounded_passes() {
        use std::sync::atomic::{AtomicU64, Ordering};

        struct DriftingManager {
            serial: AtomicU64,
        }
        impl ShellDescriptorManager for DriftingManager {
            fn get_shell_descriptor(&self) -> Result<ShellDescriptor> {
                let serial = self.serial.fetch_add(1, Ordering::SeqCst);
                Ok(ShellDescriptor::new(
                    serial,
                    vec![KERNEL_FEATURE.to_string(), SETTINGS_FEATURE.to_string()],
                ))
            }
            fn update_shell_descriptor(
                &self,
                _prior_serial: u64,
                _features: Vec<ShellFeature>,
            ) -> Result<ShellDescriptor> {
                unreachable!("not exercised")
            }
        }

        // Shadows the kernel manager with one that reports a new serial on
        // every query. The manager instance is shared across passes so the
        // serial keeps moving.
        struct DriftProvider {
            manager: Arc<dyn ShellDescriptorManager>,
        }
        impl CompositionProvider for DriftProvider {
            fn compose(&self, _settings: &ShellSettings, blueprint: &mut ShellBlueprint) {
                let drifting = self.manager.clone();
                let mut registry = CapabilityRegistry::new();
                registry
                    .feature(KERNEL_FEATURE)
                    .component("test.DriftingDescriptorManager")
                    .lifetime(Lifetime::Singleton)
                    .expose(SHELL_DESCRIPTOR_MANAGER_KEY)
                    .with_factory(move |_: &dyn Resolver| Ok(service(drifting.clone())))
                    .unwrap();
                let registration = registry.into_set().registrations()[0].clone();
                let feature = blueprint
                    .items
                    .first()
                    .map(|item| item.feature.clone())
                    .unwrap_or_else(|| crate::extensions::manifest::FeatureDescriptor {
                        id: KERNEL_FEATURE.to_string(),
                        extension_id: KERNEL_FEATURE.to_string(),
                        description: String::new(),
                        dependencies: Vec::new(),
                        priority: 0,
                    });
                blueprint.items.push(crate::composition::BlueprintItem {
                    registration,
                    feature,
                });
            }
        }

        let harness = harness(vec![Arc::new(DriftProvider {
            manager: Arc::new(DriftingManager {
                serial: AtomicU64::new(100),
            }),
        })]);
        let settings = ShellSettings::new("Default");
        // Seed a snapshot so the bootstrap path is skipped and every pass
        // goes through the drifting manager.
        harness
            .services
            .descriptor_cache
            .store("Default", &ShellDescriptor::new(
                1,
                vec![KERNEL_FEATURE.to_string(), SETTINGS_FEATURE.to_string()],
            ))
            .unwrap();

        let result = harness.factory.create_shell_context(&mut NullSink, &settings);
        assert!(matches!(result, Err(KernelError::Composition(_))));
    }

    #[test]
    fn test_setup_context_never_persists() {
        let harness = harness(Vec::new());
        let settings = ShellSettings::new("Fresh");

        let context = harness
            .factory
            .create_setup_context(&mut NullSink, &settings)
            .unwrap();

        assert_eq!(context.descriptor().serial_number, 0);
        assert_eq!(
            context.descriptor().feature_names(),
            vec![KERNEL_FEATURE, SETTINGS_FEATURE]
        );
        assert!(harness.services.descriptor_log.current("Fresh").is_none());
        assert!(harness.services.descriptor_cache.fetch("Fresh").unwrap().is_none());
    }

    #[test]
    fn test_context_resolves_kernel_services() {
        let harness = harness(Vec::new());
        let settings = ShellSettings::new("Default");
        let context = harness
            .factory
            .create_shell_context(&mut NullSink, &settings)
            .unwrap();

        let service: Arc<crate::shell::ShellSettingsService> = context
            .scope
            .resolve(&ServiceKey::new(crate::shell::SHELL_SETTINGS_SERVICE_KEY))
            .unwrap();
        assert_eq!(service.tenant(), "Default");

        context.dispose();
        assert!(context.scope.is_disposed());
    }
}
