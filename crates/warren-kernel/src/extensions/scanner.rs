//! Extension discovery: scanning the modules/ and themes/ roots.

use std::sync::Arc;

use crate::caching::TokenSink;
use crate::folder::SiteFolder;

use super::manifest::{ExtensionDescriptor, ExtensionKind, parse_manifest};

/// Scans the site folder for extension manifests.
pub struct ExtensionScanner {
    folder: Arc<SiteFolder>,
}

impl ExtensionScanner {
    pub fn new(folder: Arc<SiteFolder>) -> Self {
        Self { folder }
    }

    /// Discover every extension under both roots.
    ///
    /// Registers change tokens for the roots on `sink` so catalog caches
    /// invalidate on any change beneath them. A manifest that fails to parse
    /// is logged and skipped; it never aborts the scan.
    pub fn scan(&self, sink: &mut dyn TokenSink) -> Vec<ExtensionDescriptor> {
        let mut extensions = Vec::new();
        for kind in [ExtensionKind::Module, ExtensionKind::Theme] {
            sink.monitor(self.folder.when_path_changes(kind.root_dir()));
            let dirs = match self.folder.list_subdirs(kind.root_dir()) {
                Ok(dirs) => dirs,
                Err(err) => {
                    tracing::warn!(root = kind.root_dir(), error = %err, "extension root unreadable");
                    continue;
                }
            };
            for dir in dirs {
                let manifest_path = dir.join(kind.manifest_name());
                if !self.folder.exists(&manifest_path) {
                    continue;
                }
                let manifest = match self.folder.read_to_string(&manifest_path) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(path = %manifest_path.display(), error = %err, "manifest unreadable; skipped");
                        continue;
                    }
                };
                match parse_manifest(kind, &dir, &manifest) {
                    Ok(descriptor) => {
                        tracing::debug!(
                            extension_id = %descriptor.id,
                            kind = %descriptor.kind,
                            features = descriptor.features.len(),
                            "discovered extension"
                        );
                        extensions.push(descriptor);
                    }
                    Err(err) => {
                        tracing::warn!(path = %manifest_path.display(), error = %err, "manifest invalid; skipped");
                    }
                }
            }
        }
        extensions
    }
}
