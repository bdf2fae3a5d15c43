//! Shell state: tenant settings, descriptors, the kernel builtin feature,
//! and the shell context factory.

pub mod descriptor;
pub mod factory;
pub mod settings;

pub use descriptor::{
    DescriptorLog, MinimumDescriptorProvider, ShellDescriptor, ShellDescriptorCache,
    ShellDescriptorManager, ShellFeature,
};
pub use factory::{MAX_COMPOSE_PASSES, ShellContext, ShellContextFactory};
pub use settings::{ShellSettings, ShellSettingsManager, TenantState, validate_provider};

use std::path::PathBuf;
use std::sync::Arc;

use warren_extension_sdk::{
    CapabilityRegistry, CapabilitySet, Lifetime, RegistryResult, ServiceKey, require, service,
};

use crate::caching::Signals;
use crate::error::Result;
use crate::extensions::manifest::{ExtensionDescriptor, ExtensionKind, FeatureDescriptor};
use crate::folder::SiteFolder;

/// Id of the synthetic extension served from inside the kernel.
pub const KERNEL_EXTENSION_ID: &str = "Warren.Kernel";
/// The kernel feature every tenant needs.
pub const KERNEL_FEATURE: &str = "Warren.Kernel";
/// The settings feature included in the minimum descriptor.
pub const SETTINGS_FEATURE: &str = "Settings";

/// Key of the seeded [`KernelServices`] handle.
pub const KERNEL_SERVICES_KEY: &str = "warren.kernel.services";
/// Key of the seeded `Arc<ShellSettings>`.
pub const SHELL_SETTINGS_KEY: &str = "warren.shell.settings";
/// Key of the seeded `Arc<ShellDescriptor>` the container was built from.
pub const SHELL_DESCRIPTOR_KEY: &str = "warren.shell.descriptor";
/// Key of the in-container `Arc<dyn ShellDescriptorManager>`.
pub const SHELL_DESCRIPTOR_MANAGER_KEY: &str = "warren.shell.descriptor_manager";
/// Key of the tenant's `Arc<dyn Shell>` handle.
pub const SHELL_KEY: &str = "warren.shell";
/// Key of the settings feature's `Arc<ShellSettingsService>`.
pub const SHELL_SETTINGS_SERVICE_KEY: &str = "warren.settings.service";

/// The live tenant handle activated when a shell context starts serving.
pub trait Shell: Send + Sync {
    fn activate(&self);
    fn terminate(&self);
}

/// Default shell handle: lifecycle logging only.
pub struct DefaultShell {
    tenant: String,
}

impl DefaultShell {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
        }
    }
}

impl Shell for DefaultShell {
    fn activate(&self) {
        tracing::info!(tenant = %self.tenant, "shell activated");
    }

    fn terminate(&self) {
        tracing::info!(tenant = %self.tenant, "shell terminated");
    }
}

/// Read access to the tenant's settings, exposed by the Settings feature.
pub struct ShellSettingsService {
    settings: Arc<ShellSettings>,
}

impl ShellSettingsService {
    pub fn new(settings: Arc<ShellSettings>) -> Self {
        Self { settings }
    }

    pub fn tenant(&self) -> &str {
        &self.settings.name
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.settings.value(key)
    }
}

/// Default minimum descriptor: the kernel and settings features.
pub struct CoreMinimumDescriptor;

impl MinimumDescriptorProvider for CoreMinimumDescriptor {
    fn minimum_features(&self) -> Vec<String> {
        vec![KERNEL_FEATURE.to_string(), SETTINGS_FEATURE.to_string()]
    }
}

/// Kernel-owned services seeded into every shell container, shared across
/// tenants.
pub struct KernelServices {
    pub descriptor_log: Arc<DescriptorLog>,
    pub descriptor_cache: Arc<ShellDescriptorCache>,
    pub minimum_providers: Vec<Arc<dyn MinimumDescriptorProvider>>,
    pub signals: Arc<Signals<String>>,
}

impl KernelServices {
    pub fn open(folder: Arc<SiteFolder>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            descriptor_log: Arc::new(DescriptorLog::open(&folder)?),
            descriptor_cache: Arc::new(ShellDescriptorCache::new(folder)),
            minimum_providers: vec![Arc::new(CoreMinimumDescriptor)],
            signals: Arc::new(Signals::new()),
        }))
    }

    /// Minimum feature names across all providers, de-duplicated with
    /// provider order preserved.
    pub fn minimum_feature_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for provider in &self.minimum_providers {
            for name in provider.minimum_features() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Per-tenant descriptor manager backed by the shared descriptor log.
pub struct CoreShellDescriptorManager {
    services: Arc<KernelServices>,
    shell_name: String,
}

impl CoreShellDescriptorManager {
    pub fn new(services: Arc<KernelServices>, shell_name: impl Into<String>) -> Self {
        Self {
            services,
            shell_name: shell_name.into(),
        }
    }
}

impl ShellDescriptorManager for CoreShellDescriptorManager {
    fn get_shell_descriptor(&self) -> Result<ShellDescriptor> {
        if let Some(current) = self.services.descriptor_log.current(&self.shell_name) {
            return Ok(current);
        }
        let minimum = self.services.minimum_feature_names();
        tracing::info!(
            tenant = %self.shell_name,
            features = ?minimum,
            "no descriptor on record; synthesizing the minimum"
        );
        self.services
            .descriptor_log
            .append(&self.shell_name, minimum)
    }

    fn update_shell_descriptor(
        &self,
        prior_serial: u64,
        features: Vec<ShellFeature>,
    ) -> Result<ShellDescriptor> {
        let current = self
            .services
            .descriptor_log
            .current(&self.shell_name)
            .map(|d| d.serial_number)
            .unwrap_or(0);
        if prior_serial != current {
            return Err(crate::error::KernelError::StaleDescriptor {
                prior: prior_serial,
                current,
            });
        }
        self.services.descriptor_log.append(
            &self.shell_name,
            features.into_iter().map(|f| f.name).collect(),
        )
    }
}

/// Descriptor of the synthetic kernel extension injected into the catalog.
pub fn kernel_extension_descriptor() -> ExtensionDescriptor {
    let version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| semver::Version::new(0, 0, 0));
    ExtensionDescriptor {
        id: KERNEL_EXTENSION_ID.to_string(),
        name: "Warren Kernel".to_string(),
        version,
        description: "Runtime services built into the host".to_string(),
        kind: ExtensionKind::Module,
        location: PathBuf::new(),
        features: vec![
            FeatureDescriptor {
                id: KERNEL_FEATURE.to_string(),
                extension_id: KERNEL_EXTENSION_ID.to_string(),
                description: "Shell runtime services".to_string(),
                dependencies: Vec::new(),
                priority: 0,
            },
            FeatureDescriptor {
                id: SETTINGS_FEATURE.to_string(),
                extension_id: KERNEL_EXTENSION_ID.to_string(),
                description: "Tenant settings access".to_string(),
                dependencies: vec![KERNEL_FEATURE.to_string()],
                priority: 1,
            },
        ],
    }
}

fn register_kernel_components(registry: &mut CapabilityRegistry) -> RegistryResult<()> {
    let mut kernel = registry.feature(KERNEL_FEATURE);
    kernel
        .component("Warren.Kernel.ShellDescriptorManager")
        .lifetime(Lifetime::Singleton)
        .expose(SHELL_DESCRIPTOR_MANAGER_KEY)
        .with_factory(|resolver| {
            let services: Arc<KernelServices> =
                require(resolver, &ServiceKey::new(KERNEL_SERVICES_KEY))?;
            let settings: Arc<ShellSettings> =
                require(resolver, &ServiceKey::new(SHELL_SETTINGS_KEY))?;
            let manager: Arc<dyn ShellDescriptorManager> =
                Arc::new(CoreShellDescriptorManager::new(services, settings.name.clone()));
            Ok(service(manager))
        })?;
    kernel
        .component("Warren.Kernel.Shell")
        .lifetime(Lifetime::Singleton)
        .expose(SHELL_KEY)
        .with_factory(|resolver| {
            let settings: Arc<ShellSettings> =
                require(resolver, &ServiceKey::new(SHELL_SETTINGS_KEY))?;
            let shell: Arc<dyn Shell> = Arc::new(DefaultShell::new(settings.name.clone()));
            Ok(service(shell))
        })?;

    registry
        .feature(SETTINGS_FEATURE)
        .component("Warren.Settings.ShellSettingsService")
        .lifetime(Lifetime::Singleton)
        .expose(SHELL_SETTINGS_SERVICE_KEY)
        .with_factory(|resolver| {
            let settings: Arc<ShellSettings> =
                require(resolver, &ServiceKey::new(SHELL_SETTINGS_KEY))?;
            Ok(service(Arc::new(ShellSettingsService::new(settings))))
        })?;
    Ok(())
}

/// Capability set of the synthetic kernel extension: the in-container
/// runtime services, registered in code rather than loaded from disk.
pub fn kernel_capabilities() -> CapabilitySet {
    let mut registry = CapabilityRegistry::new();
    if let Err(err) = register_kernel_components(&mut registry) {
        // Component names are compile-time constants; this cannot collide.
        tracing::error!(error = %err, "kernel capability registration failed");
    }
    registry.into_set()
}
