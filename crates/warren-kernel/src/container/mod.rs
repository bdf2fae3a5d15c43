//! The per-tenant service container.
//!
//! [`ShellContainerFactory::create_container`] builds a two-level scope from
//! a blueprint: composition modules are instantiated first, registered under
//! their own component names so inter-module references resolve, and their
//! `configure` pass may contribute further dependency registrations; then
//! every dependency is registered under each service key it exposes, with
//! lifetime applied by its explicit [`Lifetime`] tag, with no marker-interface
//! inspection anywhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use warren_extension_sdk::{
    CapabilityRegistry, ComponentKind, ComponentRegistration, ContainerModule, Lifetime, Resolver,
    ServiceKey, SharedService,
};

use crate::composition::ShellBlueprint;
use crate::error::{KernelError, Result};
use crate::shell::{
    KERNEL_SERVICES_KEY, KernelServices, SHELL_DESCRIPTOR_KEY, SHELL_SETTINGS_KEY, ShellSettings,
};

struct ComponentSlot {
    registration: ComponentRegistration,
    singleton: Mutex<Option<SharedService>>,
}

impl ComponentSlot {
    fn new(registration: ComponentRegistration) -> Arc<Self> {
        Arc::new(Self {
            registration,
            singleton: Mutex::new(None),
        })
    }
}

/// The shell-scoped container for one tenant. Resolution is keyed by
/// [`ServiceKey`]; when several registrations expose the same key, the
/// latest one wins a single resolve and `resolve_all` returns all of them in
/// registration order.
pub struct ShellScope {
    tenant: String,
    seeds: RwLock<HashMap<ServiceKey, SharedService>>,
    slots: RwLock<Vec<Arc<ComponentSlot>>>,
    index: RwLock<HashMap<ServiceKey, Vec<usize>>>,
    disposed: AtomicBool,
}

impl ShellScope {
    fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            seeds: RwLock::new(HashMap::new()),
            slots: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Register an ambient instance under a well-known key.
    fn seed(&self, key: impl Into<ServiceKey>, payload: SharedService) {
        self.seeds.write().insert(key.into(), payload);
    }

    fn add_slot(&self, registration: ComponentRegistration, extra_key: Option<ServiceKey>) {
        let mut slots = self.slots.write();
        let mut index = self.index.write();
        let slot_index = slots.len();
        let keys = registration
            .keys
            .iter()
            .cloned()
            .chain(extra_key)
            .collect::<Vec<_>>();
        slots.push(ComponentSlot::new(registration));
        for key in keys {
            index.entry(key).or_default().push(slot_index);
        }
    }

    fn slot(&self, at: usize) -> Option<Arc<ComponentSlot>> {
        self.slots.read().get(at).cloned()
    }

    fn indices(&self, key: &ServiceKey) -> Vec<usize> {
        self.index.read().get(key).cloned().unwrap_or_default()
    }

    /// Build (or fetch) the instance for a slot, with nested resolution going
    /// through `resolver` so work-scope lifetimes stay scoped.
    fn instantiate(
        &self,
        slot: &ComponentSlot,
        resolver: &dyn Resolver,
    ) -> Result<SharedService> {
        match slot.registration.lifetime {
            Lifetime::Singleton => {
                if let Some(existing) = slot.singleton.lock().clone() {
                    return Ok(existing);
                }
                // Built outside the lock: the factory may resolve other
                // components on this scope. Concurrent first-resolves can
                // race; the first stored instance wins.
                let built = (slot.registration.factory)(resolver)?;
                let mut cell = slot.singleton.lock();
                Ok(cell.get_or_insert(built).clone())
            }
            // A work-unit component resolved without a work scope behaves
            // transiently.
            Lifetime::WorkUnit | Lifetime::Transient => {
                Ok((slot.registration.factory)(resolver)?)
            }
        }
    }

    fn resolve_slot(&self, at: usize, resolver: &dyn Resolver) -> Result<SharedService> {
        let slot = self.slot(at).ok_or_else(|| {
            KernelError::Composition(format!("unknown component slot {at}"))
        })?;
        self.instantiate(&slot, resolver)
    }

    fn resolve_raw_with(&self, key: &ServiceKey, resolver: &dyn Resolver) -> Option<SharedService> {
        if let Some(at) = self.indices(key).last().copied() {
            match self.resolve_slot(at, resolver) {
                Ok(payload) => return Some(payload),
                Err(err) => {
                    tracing::warn!(tenant = %self.tenant, key = %key, error = %err, "component factory failed");
                    return None;
                }
            }
        }
        self.seeds.read().get(key).cloned()
    }

    /// Resolve the latest registration for `key` and downcast it.
    pub fn resolve<T: Clone + 'static>(&self, key: &ServiceKey) -> Result<T> {
        self.try_resolve(key).ok_or_else(|| {
            KernelError::Composition(format!(
                "no resolvable service under key '{key}' for tenant '{}'",
                self.tenant
            ))
        })
    }

    pub fn try_resolve<T: Clone + 'static>(&self, key: &ServiceKey) -> Option<T> {
        self.resolve_raw(key)
            .and_then(|payload| payload.downcast_ref::<T>().cloned())
    }

    /// All registrations for `key`, in registration order.
    pub fn resolve_all<T: Clone + 'static>(&self, key: &ServiceKey) -> Vec<T> {
        self.indices(key)
            .into_iter()
            .filter_map(|at| self.resolve_slot(at, self).ok())
            .filter_map(|payload| payload.downcast_ref::<T>().cloned())
            .collect()
    }

    /// A scope caching work-unit instances for its own lifetime.
    pub fn create_work_scope(self: &Arc<Self>) -> WorkScope {
        WorkScope {
            shell: self.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Tear down shell-scoped state. Further resolves fail.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(tenant = %self.tenant, "disposing shell scope");
        self.index.write().clear();
        self.slots.write().clear();
        self.seeds.write().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Resolver for ShellScope {
    fn resolve_raw(&self, key: &ServiceKey) -> Option<SharedService> {
        self.resolve_raw_with(key, self)
    }
}

impl Drop for ShellScope {
    fn drop(&mut self) {
        if !self.is_disposed() {
            tracing::debug!(tenant = %self.tenant, "shell scope dropped without dispose");
        }
    }
}

/// A unit-of-work scope: work-unit components get one instance per
/// [`WorkScope`], everything else delegates to the shell scope.
pub struct WorkScope {
    shell: Arc<ShellScope>,
    instances: Mutex<HashMap<usize, SharedService>>,
}

impl WorkScope {
    pub fn resolve<T: Clone + 'static>(&self, key: &ServiceKey) -> Result<T> {
        self.try_resolve(key).ok_or_else(|| {
            KernelError::Composition(format!(
                "no resolvable service under key '{key}' for tenant '{}'",
                self.shell.tenant
            ))
        })
    }

    pub fn try_resolve<T: Clone + 'static>(&self, key: &ServiceKey) -> Option<T> {
        self.resolve_raw(key)
            .and_then(|payload| payload.downcast_ref::<T>().cloned())
    }
}

impl Resolver for WorkScope {
    fn resolve_raw(&self, key: &ServiceKey) -> Option<SharedService> {
        if let Some(at) = self.shell.indices(key).last().copied() {
            let slot = self.shell.slot(at)?;
            if slot.registration.lifetime == Lifetime::WorkUnit {
                if let Some(existing) = self.instances.lock().get(&at).cloned() {
                    return Some(existing);
                }
                return match self.shell.instantiate(&slot, self) {
                    Ok(payload) => {
                        self.instances.lock().entry(at).or_insert(payload.clone());
                        Some(payload)
                    }
                    Err(err) => {
                        tracing::warn!(
                            tenant = %self.shell.tenant,
                            key = %key,
                            error = %err,
                            "work-scoped component factory failed"
                        );
                        None
                    }
                };
            }
        }
        self.shell.resolve_raw_with(key, self)
    }
}

/// Builds shell scopes from blueprints.
pub struct ShellContainerFactory {
    services: Arc<KernelServices>,
}

impl ShellContainerFactory {
    pub fn new(services: Arc<KernelServices>) -> Self {
        Self { services }
    }

    /// Build the two-level container for a blueprint.
    ///
    /// Module items are instantiated eagerly; a module payload that is not an
    /// `Arc<dyn ContainerModule>` is a composition error and aborts the
    /// build.
    pub fn create_container(
        &self,
        settings: &ShellSettings,
        blueprint: &ShellBlueprint,
    ) -> Result<Arc<ShellScope>> {
        let scope = Arc::new(ShellScope::new(settings.name.clone()));
        scope.seed(SHELL_SETTINGS_KEY, Arc::new(Arc::new(settings.clone())));
        scope.seed(
            SHELL_DESCRIPTOR_KEY,
            Arc::new(Arc::new(blueprint.descriptor.clone())),
        );
        scope.seed(KERNEL_SERVICES_KEY, Arc::new(self.services.clone()));

        // Intermediate scope: modules, keyed by their own component names.
        let mut contributed = Vec::new();
        for item in blueprint.modules() {
            let key = ServiceKey::new(&item.registration.component_name);
            scope.add_slot(item.registration.clone(), Some(key.clone()));

            let payload = scope.resolve_raw(&key).ok_or_else(|| {
                KernelError::Composition(format!(
                    "composition module '{}' failed to build",
                    item.registration.component_name
                ))
            })?;
            let module = payload
                .downcast_ref::<Arc<dyn ContainerModule>>()
                .cloned()
                .ok_or_else(|| {
                    KernelError::Composition(format!(
                        "composition module '{}' did not produce a ContainerModule",
                        item.registration.component_name
                    ))
                })?;

            let mut registry = CapabilityRegistry::new();
            module.configure(&mut registry)?;
            for mut registration in registry.into_set().registrations().to_vec() {
                // Contributions carry the module's feature.
                registration.feature_id = item.registration.feature_id.clone();
                contributed.push(registration);
            }
        }

        // Shell scope: blueprint dependencies plus module contributions.
        for item in blueprint.dependencies() {
            scope.add_slot(item.registration.clone(), None);
        }
        for registration in contributed {
            if registration.kind == ComponentKind::Module {
                return Err(KernelError::Composition(format!(
                    "module contribution '{}' may not itself be a module",
                    registration.component_name
                )));
            }
            scope.add_slot(registration, None);
        }

        tracing::debug!(
            tenant = %settings.name,
            serial = blueprint.descriptor.serial_number,
            "shell container built"
        );
        Ok(scope)
    }
}
