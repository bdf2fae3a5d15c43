//! The monitored site folder: the single filesystem collaborator the kernel
//! consumes.
//!
//! All paths handed to a [`SiteFolder`] are relative to the site root and may
//! not traverse out of it. Besides plain file operations it hands out
//! volatile tokens for paths: `when_path_changes("modules")` returns a token
//! that goes stale when anything under `modules/` changes, fed either by a
//! `notify` watcher on the site root or directly through
//! [`SiteFolder::mark_changed`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;

use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::caching::{ExpiringToken, Token};
use crate::error::{KernelError, Result};

/// Directory of module extensions under the site root.
pub const MODULES_DIR: &str = "modules";
/// Directory of theme extensions under the site root.
pub const THEMES_DIR: &str = "themes";
/// Per-tenant settings live under `app_data/sites/<tenant>/settings.toml`.
pub const SITES_DIR: &str = "app_data/sites";
/// Tenant settings file name.
pub const SETTINGS_FILE: &str = "settings.toml";
/// Cross-restart shell descriptor snapshot.
pub const DESCRIPTOR_CACHE_FILE: &str = "app_data/cache/descriptors.json";
/// Append-only shell descriptor log.
pub const DESCRIPTOR_LOG_FILE: &str = "app_data/descriptors.log";
/// Shadow-copied module artifacts and their activation records.
pub const DEPENDENCIES_DIR: &str = "app_data/dependencies";
/// Activation record store inside [`DEPENDENCIES_DIR`].
pub const ACTIVATIONS_FILE: &str = "app_data/dependencies/activations.json";

#[derive(Default)]
struct PathTokenRegistry {
    tokens: Mutex<HashMap<PathBuf, Arc<ExpiringToken>>>,
}

impl PathTokenRegistry {
    fn when(&self, path: PathBuf) -> Token {
        let mut tokens = self.tokens.lock();
        tokens.entry(path).or_insert_with(ExpiringToken::new).clone()
    }

    /// Expire every token registered for `changed` or one of its ancestor
    /// directories, dropping the registrations in the same critical section.
    fn mark_changed(&self, changed: &Path) {
        let mut tokens = self.tokens.lock();
        tokens.retain(|registered, token| {
            let hit = changed == registered || changed.starts_with(registered);
            if hit {
                token.expire();
            }
            !hit
        });
    }
}

/// Rooted filesystem access plus path-change tokens.
pub struct SiteFolder {
    root: PathBuf,
    tokens: Arc<PathTokenRegistry>,
    // Kept alive for the folder's lifetime; dropping it stops the watch.
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl SiteFolder {
    /// Open a site folder without filesystem monitoring. Change tokens only
    /// expire through [`SiteFolder::mark_changed`].
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(Self {
            root: root.canonicalize()?,
            tokens: Arc::new(PathTokenRegistry::default()),
            _watcher: Mutex::new(None),
        }))
    }

    /// Open a site folder and start a recursive watcher on its root.
    ///
    /// If the watcher cannot start the folder still works, with a warning:
    /// tokens then stay current until marked by hand.
    pub fn with_watcher(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let folder = Self::new(root)?;
        match folder.start_watcher() {
            Ok(watcher) => {
                *folder._watcher.lock() = Some(watcher);
            }
            Err(err) => {
                tracing::warn!(
                    root = %folder.root.display(),
                    error = %err,
                    "site watcher unavailable; path tokens will not self-invalidate"
                );
            }
        }
        Ok(folder)
    }

    fn start_watcher(self: &Arc<Self>) -> notify::Result<notify::RecommendedWatcher> {
        let (tx, rx) = mpsc::channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        let registry = self.tokens.clone();
        let root = self.root.clone();
        std::thread::Builder::new()
            .name("warren-site-watcher".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    for path in event.paths {
                        if let Ok(rel) = path.strip_prefix(&root) {
                            registry.mark_changed(rel);
                        }
                    }
                }
            })
            .map_err(|e| notify::Error::generic(&e.to_string()))?;

        Ok(watcher)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `rel` against the site root, rejecting traversal components.
    pub fn map_path(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        if rel.is_absolute() {
            return Err(KernelError::PathTraversal(rel.to_path_buf()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(KernelError::PathTraversal(rel.to_path_buf())),
            }
        }
        Ok(self.root.join(rel))
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.map_path(rel).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String> {
        Ok(std::fs::read_to_string(self.map_path(rel)?)?)
    }

    /// Write a file, creating parent directories as needed.
    pub fn write(&self, rel: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.map_path(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Relative paths of the plain files directly under `rel`. A missing
    /// directory yields an empty list.
    pub fn list_files(&self, rel: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        self.list_entries(rel, |file_type| file_type.is_file())
    }

    /// Relative paths of the subdirectories directly under `rel`.
    pub fn list_subdirs(&self, rel: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        self.list_entries(rel, |file_type| file_type.is_dir())
    }

    fn list_entries(
        &self,
        rel: impl AsRef<Path>,
        keep: impl Fn(&std::fs::FileType) -> bool,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.map_path(&rel)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if keep(&entry.file_type()?) {
                entries.push(rel.as_ref().join(entry.file_name()));
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn remove_file(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.map_path(rel)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn copy_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let from = self.map_path(from)?;
        let to = self.map_path(to)?;
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        Ok(())
    }

    /// Token that stays current until `rel` (or anything under it) changes.
    pub fn when_path_changes(&self, rel: impl AsRef<Path>) -> Token {
        self.tokens.when(rel.as_ref().to_path_buf())
    }

    /// Apply a change notification for `rel` directly. This is what the
    /// watcher thread calls, and the hook tests use.
    pub fn mark_changed(&self, rel: impl AsRef<Path>) {
        self.tokens.mark_changed(rel.as_ref());
    }
}
