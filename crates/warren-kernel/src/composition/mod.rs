//! Composition: turning an enabled-feature set into a shell blueprint.
//!
//! A blueprint is built fresh on every composition and never mutated in
//! place; a changed descriptor yields an entirely new blueprint and a new
//! container. Item order follows feature discovery order (modules first), so
//! it is stable exactly when discovery order is stable; no other sort is
//! applied.

use std::collections::HashSet;
use std::sync::Arc;

use warren_extension_sdk::{ComponentKind, ComponentRegistration};

use crate::caching::TokenSink;
use crate::error::Result;
use crate::extensions::manager::{ExtensionManager, Feature};
use crate::extensions::manifest::FeatureDescriptor;
use crate::shell::{ShellDescriptor, ShellSettings};

/// One type to register into a tenant's container, with the feature it came
/// from.
#[derive(Clone)]
pub struct BlueprintItem {
    pub registration: ComponentRegistration,
    pub feature: FeatureDescriptor,
}

/// The resolved registration plan for one tenant.
#[derive(Clone)]
pub struct ShellBlueprint {
    pub settings: ShellSettings,
    pub descriptor: ShellDescriptor,
    pub items: Vec<BlueprintItem>,
}

impl ShellBlueprint {
    pub fn modules(&self) -> impl Iterator<Item = &BlueprintItem> {
        self.items
            .iter()
            .filter(|item| item.registration.kind == ComponentKind::Module)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &BlueprintItem> {
        self.items
            .iter()
            .filter(|item| item.registration.kind == ComponentKind::Dependency)
    }

    pub fn contains_component(&self, component_name: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.registration.component_name == component_name)
    }
}

/// Extension point: external providers may mutate a composed blueprint.
pub trait CompositionProvider: Send + Sync {
    fn compose(&self, settings: &ShellSettings, blueprint: &mut ShellBlueprint);
}

/// Composes descriptors into blueprints through the extension manager.
pub struct CompositionStrategy {
    extensions: Arc<ExtensionManager>,
    providers: Vec<Arc<dyn CompositionProvider>>,
}

impl CompositionStrategy {
    pub fn new(extensions: Arc<ExtensionManager>) -> Self {
        Self {
            extensions,
            providers: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompositionProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Build a blueprint for the descriptor's enabled features.
    ///
    /// Feature names with no catalog match are skipped with a warning;
    /// loading failures abort the composition. Components whose full name is
    /// suppressed by another loaded component's `replaces` are dropped.
    pub fn compose(
        &self,
        sink: &mut dyn TokenSink,
        settings: &ShellSettings,
        descriptor: &ShellDescriptor,
    ) -> Result<ShellBlueprint> {
        let available = self.extensions.available_features(sink);
        let enabled: Vec<FeatureDescriptor> = available
            .into_iter()
            .filter(|feature| descriptor.has_feature(&feature.id))
            .collect();
        for feature in &descriptor.features {
            if !enabled.iter().any(|candidate| candidate.id == feature.name) {
                tracing::warn!(
                    tenant = %settings.name,
                    feature = %feature.name,
                    "enabled feature not in catalog; skipped"
                );
            }
        }

        let features = self.extensions.load_features(sink, &enabled)?;
        let suppressed: HashSet<String> = features
            .iter()
            .flat_map(|feature| feature.components.iter())
            .filter_map(|registration| registration.replaces.clone())
            .collect();

        let mut items = Vec::new();
        collect_items(&features, &suppressed, ComponentKind::Module, &mut items);
        collect_items(&features, &suppressed, ComponentKind::Dependency, &mut items);

        let mut blueprint = ShellBlueprint {
            settings: settings.clone(),
            descriptor: descriptor.clone(),
            items,
        };
        for provider in &self.providers {
            provider.compose(settings, &mut blueprint);
        }

        tracing::debug!(
            tenant = %settings.name,
            serial = blueprint.descriptor.serial_number,
            items = blueprint.items.len(),
            suppressed = suppressed.len(),
            "composed shell blueprint"
        );
        Ok(blueprint)
    }
}

fn collect_items(
    features: &[Feature],
    suppressed: &HashSet<String>,
    kind: ComponentKind,
    items: &mut Vec<BlueprintItem>,
) {
    for feature in features {
        for registration in &feature.components {
            if registration.kind != kind {
                continue;
            }
            if suppressed.contains(&registration.component_name) {
                tracing::debug!(
                    component = %registration.component_name,
                    "component suppressed by an override"
                );
                continue;
            }
            items.push(BlueprintItem {
                registration: registration.clone(),
                feature: feature.descriptor.clone(),
            });
        }
    }
}
