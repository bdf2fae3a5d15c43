//! The host runtime: wires the kernel together and keeps one running shell
//! context per tenant.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use warren_kernel::caching::{AcquireContext, CacheHolder, NullSink, ParallelCacheContext};
use warren_kernel::extensions::{
    BuiltinModules, ExtensionDescriptor, ExtensionLoader, ExtensionLoaderCoordinator,
    PrecompiledExtensionLoader, ReferencedExtensionLoader,
};
use warren_kernel::shell::{
    KERNEL_EXTENSION_ID, KernelServices, ShellContext, ShellContextFactory, ShellSettingsManager,
    validate_provider,
};
use warren_kernel::{
    CompositionStrategy, ExtensionManager, Result, ShellContainerFactory, ShellSettings,
    SiteFolder, TenantState,
};

use crate::config::HostConfig;

/// One row of the tenant table reported by `warrend status`.
#[derive(Debug, Clone)]
pub struct TenantStatus {
    pub name: String,
    pub state: TenantState,
    pub data_provider: String,
    /// Current descriptor serial, when the tenant has one on record.
    pub serial: Option<u64>,
    pub running: bool,
}

/// The multi-tenant application host.
///
/// Tenants are independent: one tenant's configuration or composition
/// failure is logged and skipped, never propagated to the others.
pub struct WarrenHost {
    config: HostConfig,
    folder: Arc<SiteFolder>,
    services: Arc<KernelServices>,
    settings: ShellSettingsManager,
    extensions: Arc<ExtensionManager>,
    coordinator: ExtensionLoaderCoordinator,
    factory: ShellContextFactory,
    parallel: ParallelCacheContext,
    contexts: RwLock<HashMap<String, Arc<ShellContext>>>,
    restart_required: AtomicBool,
}

impl WarrenHost {
    /// Wire the kernel over the configured site root. `builtins` carries the
    /// capability providers for modules compiled into this binary.
    pub fn new(config: HostConfig, builtins: Arc<BuiltinModules>) -> Result<Self> {
        let folder = SiteFolder::with_watcher(&config.site_root)?;
        let services = KernelServices::open(folder.clone())?;
        let holder = Arc::new(CacheHolder::new());

        let loaders: Vec<Arc<dyn ExtensionLoader>> = vec![
            Arc::new(ReferencedExtensionLoader::new(builtins)),
            Arc::new(PrecompiledExtensionLoader::new(folder.clone())),
        ];
        let extensions = Arc::new(ExtensionManager::new(
            folder.clone(),
            loaders.clone(),
            holder,
        ));
        let coordinator = ExtensionLoaderCoordinator::new(folder.clone(), loaders);

        let composition = Arc::new(CompositionStrategy::new(extensions.clone()));
        let container = Arc::new(ShellContainerFactory::new(services.clone()));
        let factory = ShellContextFactory::new(composition, container, services.clone());

        Ok(Self {
            parallel: ParallelCacheContext::with_parallelism(config.parallel),
            settings: ShellSettingsManager::new(folder.clone()),
            config,
            folder,
            services,
            extensions,
            coordinator,
            factory,
            contexts: RwLock::new(HashMap::new()),
            restart_required: AtomicBool::new(false),
        })
    }

    /// Reconcile extension activations, then build a shell context for every
    /// eligible tenant.
    pub fn initialize(&self) -> Result<()> {
        let catalog = self.catalog();
        let deployable: Vec<ExtensionDescriptor> = catalog
            .into_iter()
            .filter(|extension| extension.id != KERNEL_EXTENSION_ID)
            .collect();
        if self.coordinator.setup_extensions(&deployable)? {
            self.restart_required.store(true, Ordering::SeqCst);
        }

        self.build_tenants()
    }

    /// Tear every running context down and rebuild from current state.
    pub fn reload(&self) -> Result<()> {
        tracing::info!("reloading all tenants");
        let old: Vec<Arc<ShellContext>> = self.contexts.write().drain().map(|(_, c)| c).collect();
        for context in old {
            context.dispose();
        }
        self.initialize()
    }

    /// Whether an extension change requires a process restart to take effect.
    pub fn restart_required(&self) -> bool {
        self.restart_required.load(Ordering::SeqCst)
    }

    /// Every discoverable extension, the builtin kernel extension included.
    pub fn catalog(&self) -> Vec<ExtensionDescriptor> {
        self.extensions.available_extensions(&mut NullSink)
    }

    pub fn context(&self, tenant: &str) -> Option<Arc<ShellContext>> {
        self.contexts.read().get(tenant).cloned()
    }

    pub fn running_tenants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The tenant table: settings state joined with descriptor serials and
    /// whether a context is live.
    pub fn status(&self) -> Result<Vec<TenantStatus>> {
        let contexts = self.contexts.read();
        let mut rows = Vec::new();
        for settings in self.settings.load_settings(&mut NullSink)? {
            rows.push(TenantStatus {
                serial: self
                    .services
                    .descriptor_log
                    .current(&settings.name)
                    .map(|d| d.serial_number),
                running: contexts.contains_key(&settings.name),
                name: settings.name,
                state: settings.state,
                data_provider: settings.data_provider,
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    fn build_tenants(&self) -> Result<()> {
        let mut buildable = Vec::new();
        for settings in self.settings.load_settings(&mut NullSink)? {
            match settings.state {
                TenantState::Invalid | TenantState::Disabled => {
                    tracing::info!(
                        tenant = %settings.name,
                        state = ?settings.state,
                        "tenant not eligible; skipped"
                    );
                }
                TenantState::Running => {
                    match validate_provider(&settings, &self.config.data_providers) {
                        Ok(()) => buildable.push(settings),
                        Err(err) => {
                            tracing::warn!(
                                tenant = %settings.name,
                                error = %err,
                                "tenant configuration invalid; skipped"
                            );
                        }
                    }
                }
                TenantState::Uninitialized => buildable.push(settings),
            }
        }

        let built = self.parallel.run_in_parallel(
            &mut NullSink,
            buildable,
            |settings, ctx: &mut AcquireContext| self.build_tenant(settings, ctx),
        );

        let mut contexts = self.contexts.write();
        for context in built.into_iter().flatten() {
            context.activate();
            contexts.insert(context.tenant().to_string(), Arc::new(context));
        }
        tracing::info!(tenants = contexts.len(), "host initialized");
        Ok(())
    }

    /// Build one tenant's context. Failures are logged and isolated.
    fn build_tenant(
        &self,
        settings: ShellSettings,
        ctx: &mut AcquireContext,
    ) -> Option<ShellContext> {
        let result = match settings.state {
            TenantState::Uninitialized => {
                tracing::info!(tenant = %settings.name, "tenant awaiting setup");
                self.factory.create_setup_context(ctx, &settings)
            }
            _ => self.factory.create_shell_context(ctx, &settings),
        };
        match result {
            Ok(context) => Some(context),
            Err(err) => {
                tracing::error!(
                    tenant = %settings.name,
                    error = %err,
                    "shell context construction failed; tenant not started"
                );
                None
            }
        }
    }

    pub fn folder(&self) -> &Arc<SiteFolder> {
        &self.folder
    }
}
