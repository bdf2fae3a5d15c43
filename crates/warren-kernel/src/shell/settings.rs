//! Tenant settings and their TOML persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::caching::TokenSink;
use crate::error::{KernelError, Result};
use crate::folder::{SETTINGS_FILE, SITES_DIR, SiteFolder};

/// Lifecycle state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TenantState {
    /// Enumerated but not yet set up; gets an ephemeral setup shell.
    #[default]
    Uninitialized,
    Running,
    Disabled,
    /// Settings exist but could not be read or validated.
    Invalid,
}

/// Identity and configuration of one tenant. Persisted per tenant at
/// `app_data/sites/<name>/settings.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSettings {
    pub name: String,
    #[serde(default)]
    pub state: TenantState,
    /// Data provider name, validated against the host's known providers.
    #[serde(default)]
    pub data_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Host name this tenant is served under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_host: Option<String>,
    /// URL prefix this tenant is served under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_prefix: Option<String>,
    /// Free-form extra configuration.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl ShellSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TenantState::Uninitialized,
            data_provider: String::new(),
            connection_string: None,
            request_host: None,
            request_prefix: None,
            values: BTreeMap::new(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn invalid(name: impl Into<String>) -> Self {
        Self {
            state: TenantState::Invalid,
            ..Self::new(name)
        }
    }
}

/// Classify missing or unknown data-provider configuration.
///
/// Failures here are configuration errors: the host skips the tenant with a
/// warning and the other tenants proceed.
pub fn validate_provider(settings: &ShellSettings, known_providers: &[String]) -> Result<()> {
    if settings.data_provider.is_empty() {
        return Err(KernelError::Configuration {
            tenant: settings.name.clone(),
            reason: "no data provider configured".to_string(),
        });
    }
    if !known_providers.contains(&settings.data_provider) {
        return Err(KernelError::Configuration {
            tenant: settings.name.clone(),
            reason: format!("unknown data provider '{}'", settings.data_provider),
        });
    }
    if settings.data_provider != "memory" && settings.connection_string.is_none() {
        return Err(KernelError::Configuration {
            tenant: settings.name.clone(),
            reason: format!(
                "data provider '{}' requires a connection string",
                settings.data_provider
            ),
        });
    }
    Ok(())
}

/// Enumerates and persists tenant settings files.
pub struct ShellSettingsManager {
    folder: Arc<SiteFolder>,
}

impl ShellSettingsManager {
    pub fn new(folder: Arc<SiteFolder>) -> Self {
        Self { folder }
    }

    fn settings_path(tenant: &str) -> PathBuf {
        PathBuf::from(SITES_DIR).join(tenant).join(SETTINGS_FILE)
    }

    /// Settings for every tenant directory under `app_data/sites/`.
    ///
    /// A settings file that fails to parse yields an `Invalid` tenant rather
    /// than aborting the enumeration. Registers a change token for the sites
    /// directory on `sink`.
    pub fn load_settings(&self, sink: &mut dyn TokenSink) -> Result<Vec<ShellSettings>> {
        sink.monitor(self.folder.when_path_changes(SITES_DIR));

        let mut settings = Vec::new();
        for dir in self.folder.list_subdirs(SITES_DIR)? {
            let tenant = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let path = Self::settings_path(&tenant);
            if !self.folder.exists(&path) {
                continue;
            }
            let text = self.folder.read_to_string(&path)?;
            match toml::from_str::<ShellSettings>(&text) {
                Ok(parsed) => settings.push(parsed),
                Err(err) => {
                    tracing::warn!(tenant = %tenant, error = %err, "unparseable tenant settings; marked invalid");
                    settings.push(ShellSettings::invalid(tenant));
                }
            }
        }
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &ShellSettings) -> Result<()> {
        let text = toml::to_string_pretty(settings).map_err(|err| KernelError::Configuration {
            tenant: settings.name.clone(),
            reason: err.to_string(),
        })?;
        self.folder.write(Self::settings_path(&settings.name), text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::NullSink;

    fn providers() -> Vec<String> {
        vec!["memory".to_string(), "sqlite".to_string()]
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        let manager = ShellSettingsManager::new(folder);

        let mut settings = ShellSettings::new("default");
        settings.state = TenantState::Running;
        settings.data_provider = "sqlite".to_string();
        settings.connection_string = Some("data/default.db".to_string());
        settings.request_host = Some("default.example.com".to_string());
        settings
            .values
            .insert("theme".to_string(), "dark".to_string());
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings(&mut NullSink).unwrap();
        assert_eq!(loaded, vec![settings]);
    }

    #[test]
    fn test_unparseable_settings_become_invalid_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        folder
            .write("app_data/sites/broken/settings.toml", "state = [whoops")
            .unwrap();
        folder
            .write(
                "app_data/sites/ok/settings.toml",
                "name = \"ok\"\nstate = \"Running\"\ndata_provider = \"memory\"",
            )
            .unwrap();

        let manager = ShellSettingsManager::new(folder);
        let loaded = manager.load_settings(&mut NullSink).unwrap();
        assert_eq!(loaded.len(), 2);
        let broken = loaded.iter().find(|s| s.name == "broken").unwrap();
        assert_eq!(broken.state, TenantState::Invalid);
        let ok = loaded.iter().find(|s| s.name == "ok").unwrap();
        assert_eq!(ok.state, TenantState::Running);
    }

    #[test]
    fn test_validate_provider() {
        let mut settings = ShellSettings::new("default");
        assert!(validate_provider(&settings, &providers()).is_err());

        settings.data_provider = "oracle".to_string();
        assert!(validate_provider(&settings, &providers()).is_err());

        settings.data_provider = "sqlite".to_string();
        assert!(validate_provider(&settings, &providers()).is_err());

        settings.connection_string = Some("data/default.db".to_string());
        assert!(validate_provider(&settings, &providers()).is_ok());

        settings.data_provider = "memory".to_string();
        settings.connection_string = None;
        assert!(validate_provider(&settings, &providers()).is_ok());
    }

    #[test]
    fn test_load_settings_monitors_sites_dir() {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        let manager = ShellSettingsManager::new(folder.clone());

        let mut ctx = crate::caching::AcquireContext::new();
        manager.load_settings(&mut ctx).unwrap();
        assert_eq!(ctx.tokens().len(), 1);

        folder.mark_changed("app_data/sites/new-tenant/settings.toml");
        assert!(!ctx.tokens()[0].is_current());
    }
}
