//! Precompiled loader: loads cdylib module artifacts with `libloading`.
//!
//! Probes `<extension dir>/bin/` for a platform-named artifact. Activation
//! shadow-copies the artifact into `app_data/dependencies/` so the original
//! can be replaced while the copy is loaded; a digest change on an already
//! activated artifact is a restart vote, never an error. Library handles are
//! retained for the process lifetime; unloading code that may still be
//! referenced is not supported.

use std::path::PathBuf;
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use warren_extension_sdk::{
    ABI_VERSION, ABI_VERSION_SYMBOL, CAPABILITIES_SYMBOL, CapabilitySet,
};

use crate::caching::TokenSink;
use crate::error::{KernelError, Result};
use crate::extensions::loading::{
    ActivationRecord, ActivationStore, CopyAction, DeleteAction, ExtensionLoadingContext,
    file_digest,
};
use crate::extensions::manifest::ExtensionDescriptor;
use crate::folder::{DEPENDENCIES_DIR, SiteFolder};

use super::{ExtensionLoader, ExtensionProbe, LoadedExtension, PRECOMPILED_ORDER};

/// Loader name recorded in probes and activation records.
pub const PRECOMPILED_LOADER: &str = "precompiled";

/// The order-30 loader for compiled module artifacts on disk.
pub struct PrecompiledExtensionLoader {
    folder: Arc<SiteFolder>,
    store: ActivationStore,
    // Handles live until the process exits.
    libraries: Mutex<Vec<Library>>,
}

impl PrecompiledExtensionLoader {
    pub fn new(folder: Arc<SiteFolder>) -> Self {
        Self {
            store: ActivationStore::new(folder.clone()),
            folder,
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// Platform artifact names probed inside `<extension dir>/bin/`.
    fn candidate_names(extension_id: &str) -> [String; 3] {
        [
            format!("lib{extension_id}.so"),
            format!("{extension_id}.dll"),
            format!("lib{extension_id}.dylib"),
        ]
    }

    fn find_artifact(&self, extension: &ExtensionDescriptor) -> Option<PathBuf> {
        for name in Self::candidate_names(&extension.id) {
            let rel = extension.location.join("bin").join(name);
            if self.folder.exists(&rel) {
                return Some(rel);
            }
        }
        None
    }

    fn loader_error(extension_id: &str, reason: impl Into<String>) -> KernelError {
        KernelError::Loader {
            loader: PRECOMPILED_LOADER,
            extension_id: extension_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Open the artifact and run the ABI handshake.
    fn load_capabilities(&self, extension_id: &str, artifact: &PathBuf) -> Result<CapabilitySet> {
        let path = self.folder.map_path(artifact)?;
        let library = unsafe { Library::new(&path) }
            .map_err(|err| Self::loader_error(extension_id, err.to_string()))?;

        let capabilities = unsafe {
            let abi_version: libloading::Symbol<unsafe extern "C" fn() -> u32> = library
                .get(ABI_VERSION_SYMBOL.as_bytes())
                .map_err(|err| Self::loader_error(extension_id, err.to_string()))?;
            let found = abi_version();
            if found != ABI_VERSION {
                return Err(Self::loader_error(
                    extension_id,
                    format!("abi version mismatch: module {found}, host {ABI_VERSION}"),
                ));
            }

            let capabilities: libloading::Symbol<
                unsafe extern "C" fn() -> *mut CapabilitySet,
            > = library
                .get(CAPABILITIES_SYMBOL.as_bytes())
                .map_err(|err| Self::loader_error(extension_id, err.to_string()))?;
            let raw = capabilities();
            if raw.is_null() {
                return Err(Self::loader_error(
                    extension_id,
                    "module capability registration failed",
                ));
            }
            *Box::from_raw(raw)
        };

        self.libraries.lock().push(library);
        Ok(capabilities)
    }
}

impl ExtensionLoader for PrecompiledExtensionLoader {
    fn name(&self) -> &'static str {
        PRECOMPILED_LOADER
    }

    fn order(&self) -> u32 {
        PRECOMPILED_ORDER
    }

    fn probe(&self, extension: &ExtensionDescriptor) -> Option<ExtensionProbe> {
        let artifact = self.find_artifact(extension)?;
        let modified = self
            .folder
            .map_path(&artifact)
            .ok()
            .and_then(|path| path.metadata().ok())
            .and_then(|meta| meta.modified().ok());
        Some(ExtensionProbe {
            extension_id: extension.id.clone(),
            loader: PRECOMPILED_LOADER,
            order: PRECOMPILED_ORDER,
            artifact: Some(artifact),
            modified,
        })
    }

    fn load(&self, extension: &ExtensionDescriptor) -> Result<Option<LoadedExtension>> {
        // Prefer the shadow copy recorded at activation; the original may
        // since have been replaced.
        let artifact = match self.store.find(&extension.id)? {
            Some(record) if record.loader == PRECOMPILED_LOADER => record
                .artifact_path
                .filter(|shadow| self.folder.exists(shadow))
                .or_else(|| self.find_artifact(extension)),
            _ => self.find_artifact(extension),
        };
        let Some(artifact) = artifact else {
            return Ok(None);
        };

        let capabilities = self.load_capabilities(&extension.id, &artifact)?;
        tracing::info!(
            extension_id = %extension.id,
            artifact = %artifact.display(),
            components = capabilities.len(),
            "loaded precompiled extension"
        );
        Ok(Some(LoadedExtension {
            extension_id: extension.id.clone(),
            loader: PRECOMPILED_LOADER,
            capabilities,
        }))
    }

    fn monitor(&self, extension: &ExtensionDescriptor, sink: &mut dyn TokenSink) {
        if let Some(artifact) = self.find_artifact(extension) {
            sink.monitor(self.folder.when_path_changes(artifact));
        } else {
            // Watch the bin directory so a future artifact drop is noticed.
            sink.monitor(
                self.folder
                    .when_path_changes(extension.location.join("bin")),
            );
        }
    }

    fn extension_activated(
        &self,
        ctx: &mut ExtensionLoadingContext,
        extension: &ExtensionDescriptor,
        probe: &ExtensionProbe,
        prior: Option<&ActivationRecord>,
    ) -> Result<Option<ActivationRecord>> {
        let Some(source) = probe.artifact.as_ref() else {
            return Ok(None);
        };
        let digest = file_digest(&self.folder, source)?;

        if let Some(record) = prior {
            if record.loader == PRECOMPILED_LOADER {
                let unchanged = record.digest.as_deref() == Some(digest.as_str())
                    && record
                        .artifact_path
                        .as_ref()
                        .map(|shadow| self.folder.exists(shadow))
                        .unwrap_or(false);
                if unchanged {
                    return Ok(Some(record.clone()));
                }
                // The artifact behind a live activation changed: redeploy the
                // shadow copy and require a restart to pick it up.
                if let Some(shadow) = &record.artifact_path {
                    ctx.delete_actions.push(DeleteAction {
                        path: shadow.clone(),
                    });
                }
                ctx.vote_restart(&extension.id, "artifact digest changed");
            }
        }

        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| extension.id.clone());
        let shadow = PathBuf::from(DEPENDENCIES_DIR)
            .join(format!("{}-{}", uuid::Uuid::new_v4(), file_name));
        ctx.copy_actions.push(CopyAction {
            from: source.clone(),
            to: shadow.clone(),
        });

        Ok(Some(ActivationRecord {
            extension_id: extension.id.clone(),
            loader: PRECOMPILED_LOADER.to_string(),
            artifact_path: Some(shadow),
            digest: Some(digest),
            activated_at: chrono::Utc::now(),
        }))
    }

    fn extension_deactivated(
        &self,
        ctx: &mut ExtensionLoadingContext,
        record: &ActivationRecord,
    ) {
        if let Some(shadow) = &record.artifact_path {
            ctx.delete_actions.push(DeleteAction {
                path: shadow.clone(),
            });
        }
        ctx.vote_restart(&record.extension_id, "extension deactivated while deployed");
    }

    fn extension_removed(&self, ctx: &mut ExtensionLoadingContext, record: &ActivationRecord) {
        if let Some(shadow) = &record.artifact_path {
            ctx.delete_actions.push(DeleteAction {
                path: shadow.clone(),
            });
        }
        ctx.vote_restart(&record.extension_id, "extension removed while deployed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::manifest::{ExtensionKind, parse_manifest};
    use std::path::Path;

    fn blog_descriptor() -> ExtensionDescriptor {
        parse_manifest(
            ExtensionKind::Module,
            Path::new("modules/blog"),
            "id = \"blog\"\nversion = \"1.0.0\"",
        )
        .unwrap()
    }

    fn site_with_artifact() -> (tempfile::TempDir, Arc<SiteFolder>) {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        folder
            .write("modules/blog/bin/libblog.so", b"not a real library")
            .unwrap();
        (dir, folder)
    }

    #[test]
    fn test_probe_finds_platform_artifact() {
        let (_dir, folder) = site_with_artifact();
        let loader = PrecompiledExtensionLoader::new(folder);
        let probe = loader.probe(&blog_descriptor()).unwrap();
        assert_eq!(probe.loader, PRECOMPILED_LOADER);
        assert_eq!(
            probe.artifact.as_deref(),
            Some(Path::new("modules/blog/bin/libblog.so"))
        );
        assert!(probe.modified.is_some());
    }

    #[test]
    fn test_probe_returns_none_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        let loader = PrecompiledExtensionLoader::new(folder);
        assert!(loader.probe(&blog_descriptor()).is_none());
    }

    #[test]
    fn test_activation_defers_shadow_copy() {
        let (_dir, folder) = site_with_artifact();
        let loader = PrecompiledExtensionLoader::new(folder);
        let descriptor = blog_descriptor();
        let probe = loader.probe(&descriptor).unwrap();

        let mut ctx = ExtensionLoadingContext::new();
        let record = loader
            .extension_activated(&mut ctx, &descriptor, &probe, None)
            .unwrap()
            .unwrap();

        assert_eq!(ctx.copy_actions.len(), 1);
        assert!(ctx.delete_actions.is_empty());
        assert!(!ctx.restart_required());
        assert!(record.digest.is_some());
        assert!(
            record
                .artifact_path
                .as_ref()
                .unwrap()
                .starts_with(DEPENDENCIES_DIR)
        );
    }

    #[test]
    fn test_digest_change_votes_restart() {
        let (_dir, folder) = site_with_artifact();
        let loader = PrecompiledExtensionLoader::new(folder.clone());
        let descriptor = blog_descriptor();
        let probe = loader.probe(&descriptor).unwrap();

        let mut ctx = ExtensionLoadingContext::new();
        let record = loader
            .extension_activated(&mut ctx, &descriptor, &probe, None)
            .unwrap()
            .unwrap();
        // Deploy the shadow copy as the coordinator would.
        for action in &ctx.copy_actions {
            folder.copy_file(&action.from, &action.to).unwrap();
        }

        // Unchanged artifact: the prior record is reused verbatim.
        let mut ctx = ExtensionLoadingContext::new();
        let reused = loader
            .extension_activated(&mut ctx, &descriptor, &probe, Some(&record))
            .unwrap()
            .unwrap();
        assert_eq!(reused.artifact_path, record.artifact_path);
        assert!(!ctx.restart_required());

        // Replaced artifact: redeploy plus a restart vote.
        folder
            .write("modules/blog/bin/libblog.so", b"rebuilt library")
            .unwrap();
        let mut ctx = ExtensionLoadingContext::new();
        let updated = loader
            .extension_activated(&mut ctx, &descriptor, &probe, Some(&record))
            .unwrap()
            .unwrap();
        assert!(ctx.restart_required());
        assert_eq!(ctx.delete_actions.len(), 1);
        assert_ne!(updated.digest, record.digest);
    }

    #[test]
    fn test_monitor_registers_artifact_token() {
        let (_dir, folder) = site_with_artifact();
        let loader = PrecompiledExtensionLoader::new(folder.clone());
        let mut ctx = crate::caching::AcquireContext::new();
        loader.monitor(&blog_descriptor(), &mut ctx);
        assert_eq!(ctx.tokens().len(), 1);

        folder.mark_changed("modules/blog/bin/libblog.so");
        assert!(!ctx.tokens()[0].is_current());
    }

    #[test]
    fn test_load_rejects_non_library_artifact() {
        let (_dir, folder) = site_with_artifact();
        let loader = PrecompiledExtensionLoader::new(folder);
        let err = loader.load(&blog_descriptor()).err().unwrap();
        assert!(matches!(err, KernelError::Loader { .. }));
    }
}
