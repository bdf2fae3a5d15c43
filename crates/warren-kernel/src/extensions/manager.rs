//! The extension manager: catalog queries and feature loading.
//!
//! Catalog scans and per-extension capability sets are memoized through the
//! cache framework; the tokens registered by the scanner and the loaders
//! invalidate them when anything under the extension roots changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use warren_extension_sdk::{CapabilitySet, ComponentRegistration};

use crate::caching::{CacheHolder, CacheManager, TokenSink};
use crate::error::Result;
use crate::folder::SiteFolder;
use crate::shell::{KERNEL_EXTENSION_ID, kernel_capabilities, kernel_extension_descriptor};

use super::loaders::{ExtensionLoader, rank_probes};
use super::manifest::{ExtensionDescriptor, FeatureDescriptor};
use super::scanner::ExtensionScanner;

/// A runtime feature: its descriptor paired with the component registrations
/// the owning extension exports under the feature id. Created once per shell
/// composition and discarded when the shell recomposes.
#[derive(Clone)]
pub struct Feature {
    pub descriptor: FeatureDescriptor,
    pub components: Vec<ComponentRegistration>,
}

/// Catalogs discoverable extensions and turns feature sets into components.
pub struct ExtensionManager {
    scanner: ExtensionScanner,
    loaders: Vec<Arc<dyn ExtensionLoader>>,
    cache: CacheManager,
}

impl ExtensionManager {
    pub fn new(
        folder: Arc<SiteFolder>,
        mut loaders: Vec<Arc<dyn ExtensionLoader>>,
        holder: Arc<CacheHolder>,
    ) -> Self {
        loaders.sort_by_key(|loader| loader.order());
        Self {
            scanner: ExtensionScanner::new(folder),
            loaders,
            cache: CacheManager::new::<ExtensionManager>(holder),
        }
    }

    /// Every discoverable extension, the synthetic kernel extension first.
    pub fn available_extensions(&self, sink: &mut dyn TokenSink) -> Vec<ExtensionDescriptor> {
        self.cache
            .get_within(sink, "extensions".to_string(), |ctx| {
                let mut extensions = vec![kernel_extension_descriptor()];
                extensions.extend(self.scanner.scan(ctx));
                extensions
            })
    }

    /// All features, ordered so dependencies precede dependents. Ties keep
    /// discovery order; a dependency cycle logs a warning and falls back to
    /// discovery order for the cycle's members.
    pub fn available_features(&self, sink: &mut dyn TokenSink) -> Vec<FeatureDescriptor> {
        let features: Vec<FeatureDescriptor> = self
            .available_extensions(sink)
            .into_iter()
            .flat_map(|extension| extension.features)
            .collect();
        dependency_order(features)
    }

    /// Resolve the requested features to their component registrations.
    ///
    /// A feature whose owning extension is missing from the catalog is
    /// skipped with a warning; a loader failure is a composition error and
    /// propagates.
    pub fn load_features(
        &self,
        sink: &mut dyn TokenSink,
        requested: &[FeatureDescriptor],
    ) -> Result<Vec<Feature>> {
        let extensions: HashMap<String, ExtensionDescriptor> = self
            .available_extensions(sink)
            .into_iter()
            .map(|extension| (extension.id.clone(), extension))
            .collect();

        let mut features = Vec::with_capacity(requested.len());
        for descriptor in requested {
            let Some(extension) = extensions.get(&descriptor.extension_id) else {
                tracing::warn!(
                    feature = %descriptor.id,
                    extension_id = %descriptor.extension_id,
                    "owning extension not in catalog; feature skipped"
                );
                continue;
            };
            let capabilities = self.capability_set(sink, extension)?;
            features.push(Feature {
                descriptor: descriptor.clone(),
                components: capabilities.for_feature(&descriptor.id),
            });
        }
        Ok(features)
    }

    /// The extension's capability set, loaded through the loader chain and
    /// memoized per extension id until a monitored token goes stale.
    fn capability_set(
        &self,
        sink: &mut dyn TokenSink,
        extension: &ExtensionDescriptor,
    ) -> Result<CapabilitySet> {
        if extension.id == KERNEL_EXTENSION_ID {
            return Ok(kernel_capabilities());
        }
        self.cache
            .try_get_within(sink, extension.id.clone(), |ctx| {
                for loader in &self.loaders {
                    loader.monitor(extension, ctx);
                }
                let probes = self
                    .loaders
                    .iter()
                    .filter_map(|loader| loader.probe(extension))
                    .collect();
                let Some(winner) = rank_probes(probes) else {
                    tracing::warn!(
                        extension_id = %extension.id,
                        "no loader claims extension; serving no components"
                    );
                    return Ok(CapabilitySet::default());
                };
                let loaded = self
                    .loaders
                    .iter()
                    .find(|loader| loader.name() == winner.loader)
                    .map(|loader| loader.load(extension))
                    .transpose()?
                    .flatten();
                match loaded {
                    Some(loaded) => Ok(loaded.capabilities),
                    None => {
                        tracing::warn!(
                            extension_id = %extension.id,
                            loader = winner.loader,
                            "probe succeeded but load produced nothing"
                        );
                        Ok(CapabilitySet::default())
                    }
                }
            })
    }
}

/// Stable dependency-first ordering of feature descriptors.
fn dependency_order(features: Vec<FeatureDescriptor>) -> Vec<FeatureDescriptor> {
    let known: HashSet<String> = features.iter().map(|f| f.id.clone()).collect();
    let mut remaining = features;
    let mut emitted: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let next = remaining.iter().position(|feature| {
            feature
                .dependencies
                .iter()
                .all(|dep| emitted.contains(dep) || !known.contains(dep))
        });
        match next {
            Some(index) => {
                let feature = remaining.remove(index);
                emitted.insert(feature.id.clone());
                ordered.push(feature);
            }
            None => {
                tracing::warn!(
                    members = ?remaining.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
                    "feature dependency cycle; keeping discovery order for its members"
                );
                ordered.append(&mut remaining);
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str, deps: &[&str]) -> FeatureDescriptor {
        FeatureDescriptor {
            id: id.to_string(),
            extension_id: id.to_string(),
            description: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
        }
    }

    fn ids(features: &[FeatureDescriptor]) -> Vec<&str> {
        features.iter().map(|f| f.id.as_str()).collect()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let ordered = dependency_order(vec![
            feature("blog", &["settings"]),
            feature("settings", &[]),
            feature("feeds", &["blog"]),
        ]);
        assert_eq!(ids(&ordered), vec!["settings", "blog", "feeds"]);
    }

    #[test]
    fn test_ties_keep_discovery_order() {
        let ordered = dependency_order(vec![
            feature("a", &[]),
            feature("b", &[]),
            feature("c", &[]),
        ]);
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_dependency_is_satisfied() {
        let ordered = dependency_order(vec![feature("blog", &["not-installed"])]);
        assert_eq!(ids(&ordered), vec!["blog"]);
    }

    #[test]
    fn test_cycle_falls_back_to_discovery_order() {
        let ordered = dependency_order(vec![
            feature("x", &["y"]),
            feature("y", &["x"]),
            feature("z", &[]),
        ]);
        assert_eq!(ids(&ordered), vec!["z", "x", "y"]);
    }
}
