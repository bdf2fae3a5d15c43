//! Extension manifests and descriptors.
//!
//! Every extension directory carries a `module.toml` or `theme.toml`
//! manifest. Descriptors are immutable per scan cycle and rebuilt whenever
//! the catalog is re-scanned.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KernelError, Result};

/// What kind of deployable unit an extension is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Module,
    Theme,
}

impl ExtensionKind {
    /// Root directory the kind is discovered under.
    pub fn root_dir(&self) -> &'static str {
        match self {
            ExtensionKind::Module => crate::folder::MODULES_DIR,
            ExtensionKind::Theme => crate::folder::THEMES_DIR,
        }
    }

    /// Manifest file name inside an extension directory.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            ExtensionKind::Module => "module.toml",
            ExtensionKind::Theme => "theme.toml",
        }
    }
}

impl std::fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionKind::Module => f.write_str("Module"),
            ExtensionKind::Theme => f.write_str("Theme"),
        }
    }
}

/// A named unit of functionality belonging to exactly one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescriptor {
    pub id: String,
    /// Id of the owning extension.
    pub extension_id: String,
    pub description: String,
    /// Ids of features this one depends on.
    pub dependencies: Vec<String>,
    /// Manifest order within the owning extension.
    pub priority: usize,
}

/// One discovered extension: identity, location, and the features it
/// contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    pub id: String,
    pub name: String,
    pub version: semver::Version,
    pub description: String,
    pub kind: ExtensionKind,
    /// Directory of the extension, relative to the site root.
    pub location: PathBuf,
    pub features: Vec<FeatureDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    id: String,
    name: Option<String>,
    version: semver::Version,
    #[serde(default)]
    description: String,
    #[serde(default)]
    features: Vec<ManifestFeature>,
}

#[derive(Debug, Deserialize)]
struct ManifestFeature {
    id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Parse a manifest into a descriptor.
///
/// A manifest that declares no features gets a default feature whose id is
/// the extension id.
pub fn parse_manifest(
    kind: ExtensionKind,
    location: &Path,
    manifest: &str,
) -> Result<ExtensionDescriptor> {
    let parsed: ManifestFile =
        toml::from_str(manifest).map_err(|err| KernelError::Manifest {
            path: location.join(kind.manifest_name()),
            reason: err.to_string(),
        })?;

    let extension_id = parsed.id.clone();
    let mut features: Vec<FeatureDescriptor> = parsed
        .features
        .into_iter()
        .enumerate()
        .map(|(priority, feature)| FeatureDescriptor {
            id: feature.id,
            extension_id: extension_id.clone(),
            description: feature.description,
            dependencies: feature.dependencies,
            priority,
        })
        .collect();
    if features.is_empty() {
        features.push(FeatureDescriptor {
            id: extension_id.clone(),
            extension_id: extension_id.clone(),
            description: parsed.description.clone(),
            dependencies: Vec::new(),
            priority: 0,
        });
    }

    Ok(ExtensionDescriptor {
        name: parsed.name.unwrap_or_else(|| extension_id.clone()),
        id: extension_id,
        version: parsed.version,
        description: parsed.description,
        kind,
        location: location.to_path_buf(),
        features,
    })
}
