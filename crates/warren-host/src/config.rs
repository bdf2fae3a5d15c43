//! Host configuration resolved from flags and the environment.

use std::path::PathBuf;

/// Environment variable naming the site root when no flag is given.
pub const SITE_ROOT_ENV: &str = "WARREN_SITE_ROOT";

/// Data providers the host knows how to validate tenant settings against.
pub const KNOWN_DATA_PROVIDERS: &[&str] = &["memory", "sqlite", "postgres"];

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root of the site folder every path in the kernel is relative to.
    pub site_root: PathBuf,
    /// Fan per-tenant builds across threads.
    pub parallel: bool,
    pub data_providers: Vec<String>,
}

impl HostConfig {
    pub fn new(site_root: impl Into<PathBuf>) -> Self {
        Self {
            site_root: site_root.into(),
            parallel: true,
            data_providers: KNOWN_DATA_PROVIDERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    /// Resolve the site root: explicit flag, then `WARREN_SITE_ROOT`, then
    /// the current directory.
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        let site_root = flag
            .or_else(|| std::env::var_os(SITE_ROOT_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(site_root)
    }

    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins_over_default() {
        let config = HostConfig::resolve(Some(PathBuf::from("/srv/warren")));
        assert_eq!(config.site_root, PathBuf::from("/srv/warren"));
        assert!(config.parallel);
        assert!(config.data_providers.contains(&"memory".to_string()));
    }
}
