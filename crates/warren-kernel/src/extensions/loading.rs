//! Extension loading coordination.
//!
//! Loaders never touch the filesystem while voting: copy and delete actions
//! accumulate on an [`ExtensionLoadingContext`] and run only after every
//! loader has had its say, so a loader error leaves no partially deployed
//! extension behind. Activation outcomes persist as
//! [`ActivationRecord`]s in `app_data/dependencies/activations.json` and are
//! compared across restarts to detect loader changes and removed extensions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::folder::{ACTIVATIONS_FILE, SiteFolder};

use super::loaders::{ExtensionLoader, rank_probes};
use super::manifest::ExtensionDescriptor;

/// A deferred file copy, relative to the site root.
#[derive(Debug, Clone)]
pub struct CopyAction {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// A deferred file removal, relative to the site root.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    pub path: PathBuf,
}

/// Shared voting state for one coordination pass.
#[derive(Debug, Default)]
pub struct ExtensionLoadingContext {
    pub copy_actions: Vec<CopyAction>,
    pub delete_actions: Vec<DeleteAction>,
    restart_required: bool,
}

impl ExtensionLoadingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the host process must restart before the change takes
    /// effect. Never an error: the vote is surfaced, not thrown.
    pub fn vote_restart(&mut self, extension_id: &str, reason: &str) {
        tracing::warn!(extension_id, reason, "extension change requires a host restart");
        self.restart_required = true;
    }

    pub fn restart_required(&self) -> bool {
        self.restart_required
    }
}

/// Persisted outcome of one extension activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub extension_id: String,
    /// Name of the loader that served the extension.
    pub loader: String,
    /// Deployed artifact path relative to the site root; `None` for builtins.
    pub artifact_path: Option<PathBuf>,
    /// Sha256 digest of the source artifact at activation time.
    pub digest: Option<String>,
    pub activated_at: chrono::DateTime<chrono::Utc>,
}

impl ActivationRecord {
    /// Record for an extension with no on-disk artifact.
    pub fn builtin(extension_id: &str, loader: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            loader: loader.to_string(),
            artifact_path: None,
            digest: None,
            activated_at: chrono::Utc::now(),
        }
    }
}

/// JSON-backed store of activation records, surviving restarts.
pub struct ActivationStore {
    folder: Arc<SiteFolder>,
}

impl ActivationStore {
    pub fn new(folder: Arc<SiteFolder>) -> Self {
        Self { folder }
    }

    /// All persisted records. An absent store file is an empty store.
    pub fn load(&self) -> Result<Vec<ActivationRecord>> {
        if !self.folder.exists(ACTIVATIONS_FILE) {
            return Ok(Vec::new());
        }
        let text = self.folder.read_to_string(ACTIVATIONS_FILE)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, records: &[ActivationRecord]) -> Result<()> {
        let text = serde_json::to_string_pretty(records)?;
        self.folder.write(ACTIVATIONS_FILE, text)
    }

    /// The persisted record for one extension, if any.
    pub fn find(&self, extension_id: &str) -> Result<Option<ActivationRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|record| record.extension_id == extension_id))
    }
}

/// Sha256 digest of a file under the site root, hex encoded.
pub fn file_digest(folder: &SiteFolder, rel: &Path) -> Result<String> {
    let bytes = std::fs::read(folder.map_path(rel)?)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Runs the activation protocol: probe, vote, then act.
pub struct ExtensionLoaderCoordinator {
    folder: Arc<SiteFolder>,
    loaders: Vec<Arc<dyn ExtensionLoader>>,
    store: ActivationStore,
}

impl ExtensionLoaderCoordinator {
    pub fn new(folder: Arc<SiteFolder>, mut loaders: Vec<Arc<dyn ExtensionLoader>>) -> Self {
        loaders.sort_by_key(|loader| loader.order());
        Self {
            store: ActivationStore::new(folder.clone()),
            folder,
            loaders,
        }
    }

    fn loader_named(&self, name: &str) -> Option<&Arc<dyn ExtensionLoader>> {
        self.loaders.iter().find(|loader| loader.name() == name)
    }

    /// Reconcile the catalog against the prior activation records.
    ///
    /// Every loader votes before any deferred action runs; deletes execute
    /// before copies. Returns whether the host must restart for the new state
    /// to take effect.
    pub fn setup_extensions(&self, extensions: &[ExtensionDescriptor]) -> Result<bool> {
        let prior = self.store.load()?;
        let prior_by_id: HashMap<&str, &ActivationRecord> = prior
            .iter()
            .map(|record| (record.extension_id.as_str(), record))
            .collect();

        let mut ctx = ExtensionLoadingContext::new();
        let mut records = Vec::new();

        for extension in extensions {
            let probes = self
                .loaders
                .iter()
                .filter_map(|loader| loader.probe(extension))
                .collect();
            let Some(winner) = rank_probes(probes) else {
                tracing::debug!(extension_id = %extension.id, "no loader claims extension; unavailable");
                if let Some(record) = prior_by_id.get(extension.id.as_str()) {
                    if let Some(loader) = self.loader_named(&record.loader) {
                        loader.extension_removed(&mut ctx, record);
                    }
                }
                continue;
            };

            let prior_record = prior_by_id.get(extension.id.as_str()).copied();
            if let Some(record) = prior_record {
                if record.loader != winner.loader {
                    if let Some(previous) = self.loader_named(&record.loader) {
                        previous.extension_deactivated(&mut ctx, record);
                    }
                }
            }

            let Some(loader) = self.loader_named(winner.loader) else {
                // Probes only come from the registered chain.
                continue;
            };
            if let Some(record) =
                loader.extension_activated(&mut ctx, extension, &winner, prior_record)?
            {
                records.push(record);
            }
        }

        // Extensions that vanished from the catalog entirely.
        for record in &prior {
            let still_present = extensions
                .iter()
                .any(|extension| extension.id == record.extension_id);
            if !still_present {
                if let Some(loader) = self.loader_named(&record.loader) {
                    loader.extension_removed(&mut ctx, record);
                }
            }
        }

        for action in &ctx.delete_actions {
            tracing::info!(path = %action.path.display(), "removing stale extension artifact");
            self.folder.remove_file(&action.path)?;
        }
        for action in &ctx.copy_actions {
            tracing::info!(
                from = %action.from.display(),
                to = %action.to.display(),
                "deploying extension artifact"
            );
            self.folder.copy_file(&action.from, &action.to)?;
        }

        self.store.save(&records)?;
        Ok(ctx.restart_required())
    }
}
