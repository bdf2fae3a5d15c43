//! Extension discovery, loading, and cataloging.

pub mod loaders;
pub mod loading;
pub mod manager;
pub mod manifest;
pub mod scanner;

pub use loaders::{
    BuiltinCapabilityProvider, BuiltinModules, ExtensionLoader, ExtensionProbe, LoadedExtension,
    PrecompiledExtensionLoader, ReferencedExtensionLoader,
};
pub use loading::{
    ActivationRecord, ActivationStore, ExtensionLoaderCoordinator, ExtensionLoadingContext,
};
pub use manager::{ExtensionManager, Feature};
pub use manifest::{ExtensionDescriptor, ExtensionKind, FeatureDescriptor};
pub use scanner::ExtensionScanner;
