//! The extension loader chain.
//!
//! A loader locates a deployable form of an extension (`probe`), produces its
//! capability set (`load`), and votes on activation lifecycle through the
//! shared [`ExtensionLoadingContext`]. Loaders are tried in ascending order;
//! a loader that cannot service an extension returns `None` rather than
//! erroring: "no loader claims this extension" means unavailable, not
//! failure.

mod precompiled;
mod referenced;

pub use precompiled::PrecompiledExtensionLoader;
pub use referenced::{BuiltinCapabilityProvider, BuiltinModules, ReferencedExtensionLoader};

use std::path::PathBuf;
use std::time::SystemTime;

use warren_extension_sdk::CapabilitySet;

use crate::caching::TokenSink;
use crate::error::Result;

use super::loading::{ActivationRecord, ExtensionLoadingContext};
use super::manifest::ExtensionDescriptor;

/// Chain position of the referenced loader. Builtins win: code compiled into
/// the host is authoritative over anything on disk.
pub const REFERENCED_ORDER: u32 = 20;
/// Chain position of the precompiled loader.
pub const PRECOMPILED_ORDER: u32 = 30;

/// A successful probe: where a loader found a deployable form.
#[derive(Debug, Clone)]
pub struct ExtensionProbe {
    pub extension_id: String,
    /// Name of the loader that produced the probe.
    pub loader: &'static str,
    pub order: u32,
    /// Artifact path relative to the site root; `None` for builtins.
    pub artifact: Option<PathBuf>,
    /// Artifact modification time, used to break order ties.
    pub modified: Option<SystemTime>,
}

/// A loaded extension: its capability set and provenance.
pub struct LoadedExtension {
    pub extension_id: String,
    pub loader: &'static str,
    pub capabilities: CapabilitySet,
}

/// One strategy for locating and loading extensions.
pub trait ExtensionLoader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chain position; lower goes first.
    fn order(&self) -> u32;

    /// Locate a deployable form of the extension, or `None` when this loader
    /// cannot service it.
    fn probe(&self, extension: &ExtensionDescriptor) -> Option<ExtensionProbe>;

    /// Load the extension's capability set. `Ok(None)` mirrors a failed
    /// probe; an `Err` is a composition error.
    fn load(&self, extension: &ExtensionDescriptor) -> Result<Option<LoadedExtension>>;

    /// Register invalidation tokens for whatever the loader serves the
    /// extension from.
    fn monitor(&self, _extension: &ExtensionDescriptor, _sink: &mut dyn TokenSink) {}

    /// Called when this loader wins the probe for an extension. Returns the
    /// activation record to persist; deferred copy/delete actions and restart
    /// votes go on `ctx`.
    fn extension_activated(
        &self,
        _ctx: &mut ExtensionLoadingContext,
        extension: &ExtensionDescriptor,
        probe: &ExtensionProbe,
        _prior: Option<&ActivationRecord>,
    ) -> Result<Option<ActivationRecord>> {
        let _ = (extension, probe);
        Ok(None)
    }

    /// Called when this loader previously served an extension that another
    /// loader now wins.
    fn extension_deactivated(
        &self,
        _ctx: &mut ExtensionLoadingContext,
        _record: &ActivationRecord,
    ) {
    }

    /// Called when an extension this loader served has disappeared from the
    /// catalog.
    fn extension_removed(&self, _ctx: &mut ExtensionLoadingContext, _record: &ActivationRecord) {}
}

/// Pick the winning probe: ascending loader order, newest artifact first
/// within a tie.
pub fn rank_probes(mut probes: Vec<ExtensionProbe>) -> Option<ExtensionProbe> {
    probes.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then_with(|| b.modified.cmp(&a.modified))
    });
    probes.into_iter().next()
}
