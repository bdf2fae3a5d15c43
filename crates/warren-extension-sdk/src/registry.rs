//! Capability registration: the explicit alternative to reflection.
//!
//! A module declares what it provides by calling into a [`CapabilityRegistry`]
//! builder; the host never scans a loaded artifact for types. Each
//! registration carries the owning feature id, the component's full name, its
//! [`ComponentKind`] and [`Lifetime`], the service keys it is exposed under,
//! an optional `replaces` full name (suppression), and the factory closure
//! that constructs the instance inside a container.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{RegistryError, RegistryResult};
use crate::types::{ComponentKind, Lifetime, Resolver, ServiceKey, SharedService};

/// Factory closure constructing a component instance inside a container.
pub type ComponentFactory =
    Arc<dyn Fn(&dyn Resolver) -> RegistryResult<SharedService> + Send + Sync>;

/// One registered component: everything the container needs to build and
/// expose an instance.
#[derive(Clone)]
pub struct ComponentRegistration {
    /// Feature this component belongs to.
    pub feature_id: String,
    /// Full component name, unique within a registry.
    pub component_name: String,
    pub kind: ComponentKind,
    pub lifetime: Lifetime,
    /// Service keys the component is exposed under.
    pub keys: Vec<ServiceKey>,
    /// Full name of a component this one suppresses, if any.
    pub replaces: Option<String>,
    pub factory: ComponentFactory,
}

impl fmt::Debug for ComponentRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistration")
            .field("feature_id", &self.feature_id)
            .field("component_name", &self.component_name)
            .field("kind", &self.kind)
            .field("lifetime", &self.lifetime)
            .field("keys", &self.keys)
            .field("replaces", &self.replaces)
            .finish()
    }
}

/// The immutable output of a module's registration pass.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    registrations: Vec<ComponentRegistration>,
}

impl CapabilitySet {
    pub fn registrations(&self) -> &[ComponentRegistration] {
        &self.registrations
    }

    /// Registrations belonging to one feature, in registration order.
    pub fn for_feature(&self, feature_id: &str) -> Vec<ComponentRegistration> {
        self.registrations
            .iter()
            .filter(|r| r.feature_id == feature_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Builder collecting component registrations.
#[derive(Default)]
pub struct CapabilityRegistry {
    registrations: Vec<ComponentRegistration>,
    names: HashSet<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start registering components for one feature.
    pub fn feature(&mut self, feature_id: impl Into<String>) -> FeatureRegistrar<'_> {
        FeatureRegistrar {
            registry: self,
            feature_id: feature_id.into(),
        }
    }

    /// Register a pre-built registration. Component full names must be unique.
    pub fn register(&mut self, registration: ComponentRegistration) -> RegistryResult<()> {
        if !self.names.insert(registration.component_name.clone()) {
            return Err(RegistryError::Duplicate(registration.component_name));
        }
        self.registrations.push(registration);
        Ok(())
    }

    pub fn into_set(self) -> CapabilitySet {
        CapabilitySet {
            registrations: self.registrations,
        }
    }
}

/// Registers components under one feature id.
pub struct FeatureRegistrar<'a> {
    registry: &'a mut CapabilityRegistry,
    feature_id: String,
}

impl FeatureRegistrar<'_> {
    /// Begin a plain dependency registration.
    pub fn component(&mut self, name: impl Into<String>) -> ComponentBuilder<'_> {
        self.builder(name.into(), ComponentKind::Dependency)
    }

    /// Begin a composition-module registration. The factory must produce an
    /// `Arc<dyn ContainerModule>` payload.
    pub fn module(&mut self, name: impl Into<String>) -> ComponentBuilder<'_> {
        self.builder(name.into(), ComponentKind::Module)
    }

    fn builder(&mut self, name: String, kind: ComponentKind) -> ComponentBuilder<'_> {
        ComponentBuilder {
            registry: self.registry,
            feature_id: self.feature_id.clone(),
            component_name: name,
            kind,
            lifetime: Lifetime::Singleton,
            keys: Vec::new(),
            replaces: None,
        }
    }
}

/// Fluent builder for a single component registration; finished by
/// [`ComponentBuilder::with_factory`].
pub struct ComponentBuilder<'a> {
    registry: &'a mut CapabilityRegistry,
    feature_id: String,
    component_name: String,
    kind: ComponentKind,
    lifetime: Lifetime,
    keys: Vec<ServiceKey>,
    replaces: Option<String>,
}

impl ComponentBuilder<'_> {
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Expose the component under an additional service key.
    pub fn expose(mut self, key: impl Into<ServiceKey>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Declare that this component suppresses another component's full name.
    pub fn replaces(mut self, component_name: impl Into<String>) -> Self {
        self.replaces = Some(component_name.into());
        self
    }

    /// Attach the factory and commit the registration.
    pub fn with_factory<F>(self, factory: F) -> RegistryResult<()>
    where
        F: Fn(&dyn Resolver) -> RegistryResult<SharedService> + Send + Sync + 'static,
    {
        self.registry.register(ComponentRegistration {
            feature_id: self.feature_id,
            component_name: self.component_name,
            kind: self.kind,
            lifetime: self.lifetime,
            keys: self.keys,
            replaces: self.replaces,
            factory: Arc::new(factory),
        })
    }
}

/// A composition module instantiated inside the container's intermediate
/// scope. Its `configure` pass may contribute further dependency
/// registrations, which the container registers into the shell scope tagged
/// with the module's feature.
pub trait ContainerModule: Send + Sync {
    fn configure(&self, registry: &mut CapabilityRegistry) -> RegistryResult<()>;
}

/// Wrap a [`ContainerModule`] for storage as a factory payload.
pub fn module_service(module: Arc<dyn ContainerModule>) -> SharedService {
    Arc::new(module)
}
