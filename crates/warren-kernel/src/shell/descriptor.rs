//! Shell descriptors: the versioned record of which features a tenant has
//! enabled, and the two stores behind it.
//!
//! The [`DescriptorLog`] is authoritative: an append-only file of
//! length-prefixed bincode records where the most recent entry per tenant
//! wins and older serials are superseded, never deleted. The
//! [`ShellDescriptorCache`] is the small cross-restart snapshot consulted
//! before any container exists, one `"<serial>|<f1>;<f2>;...;"` entry per
//! tenant.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::folder::{DESCRIPTOR_CACHE_FILE, DESCRIPTOR_LOG_FILE, SiteFolder};

/// One enabled feature, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellFeature {
    pub name: String,
}

impl ShellFeature {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// What is enabled for a tenant right now. Serial numbers strictly increase
/// per tenant; a blueprint or container is valid only for the serial it was
/// built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellDescriptor {
    pub serial_number: u64,
    pub features: Vec<ShellFeature>,
}

impl ShellDescriptor {
    pub fn new(serial_number: u64, feature_names: Vec<String>) -> Self {
        Self {
            serial_number,
            features: feature_names.into_iter().map(ShellFeature::new).collect(),
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorLogEntry {
    serial_number: u64,
    shell_name: String,
    feature_names: Vec<String>,
}

impl DescriptorLogEntry {
    fn to_descriptor(&self) -> ShellDescriptor {
        ShellDescriptor::new(self.serial_number, self.feature_names.clone())
    }
}

struct LogInner {
    entries: Vec<DescriptorLogEntry>,
    file: File,
    next_serial: u64,
}

/// The append-only descriptor log at `app_data/descriptors.log`.
///
/// Records are framed as a `u32` little-endian length followed by that many
/// bytes of bincode. The serial counter is process-wide monotonic, guarded by
/// the same lock as the entries and initialized from the highest serial on
/// disk so restarts preserve monotonicity.
pub struct DescriptorLog {
    inner: Mutex<LogInner>,
}

impl DescriptorLog {
    /// Open (or create) the log, loading all entries. A truncated trailing
    /// record from a torn write is dropped with a warning and the file is
    /// trimmed back to the last whole record.
    pub fn open(folder: &SiteFolder) -> Result<Self> {
        let path = folder.map_path(DESCRIPTOR_LOG_FILE)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = if path.exists() {
            std::fs::read(&path)?
        } else {
            Vec::new()
        };
        let (entries, valid_len) = Self::decode_entries(&bytes);
        if valid_len < bytes.len() {
            tracing::warn!(
                dropped_bytes = bytes.len() - valid_len,
                "descriptor log ends in a torn record; dropping it"
            );
        }

        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.set_len(valid_len as u64)?;
        file.seek(SeekFrom::End(0))?;

        let next_serial = entries
            .iter()
            .map(|entry| entry.serial_number)
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            inner: Mutex::new(LogInner {
                entries,
                file,
                next_serial,
            }),
        })
    }

    fn decode_entries(bytes: &[u8]) -> (Vec<DescriptorLogEntry>, usize) {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while bytes.len() - offset >= 4 {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            if bytes.len() - offset - 4 < len {
                break;
            }
            match bincode::deserialize::<DescriptorLogEntry>(&bytes[offset + 4..offset + 4 + len])
            {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
            offset += 4 + len;
        }
        (entries, offset)
    }

    /// The authoritative descriptor for a tenant: its most recent entry.
    pub fn current(&self, shell_name: &str) -> Option<ShellDescriptor> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .find(|entry| entry.shell_name == shell_name)
            .map(DescriptorLogEntry::to_descriptor)
    }

    /// Every entry for a tenant in append order; superseded serials included.
    pub fn history(&self, shell_name: &str) -> Vec<ShellDescriptor> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.shell_name == shell_name)
            .map(DescriptorLogEntry::to_descriptor)
            .collect()
    }

    /// Append a new descriptor with a freshly allocated serial.
    pub fn append(&self, shell_name: &str, feature_names: Vec<String>) -> Result<ShellDescriptor> {
        let mut inner = self.inner.lock();
        let entry = DescriptorLogEntry {
            serial_number: inner.next_serial,
            shell_name: shell_name.to_string(),
            feature_names,
        };

        let payload = bincode::serialize(&entry)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            KernelError::Composition("descriptor log record exceeds frame size".to_string())
        })?;
        inner.file.write_all(&len.to_le_bytes())?;
        inner.file.write_all(&payload)?;
        inner.file.flush()?;

        inner.next_serial += 1;
        let descriptor = entry.to_descriptor();
        inner.entries.push(entry);
        Ok(descriptor)
    }
}

/// Cross-restart snapshot of each tenant's current descriptor, read before a
/// container exists. JSON object with one `"<serial>|<f1>;<f2>;...;"` string
/// per tenant at `app_data/cache/descriptors.json`.
pub struct ShellDescriptorCache {
    folder: Arc<SiteFolder>,
    guard: Mutex<()>,
}

impl ShellDescriptorCache {
    pub fn new(folder: Arc<SiteFolder>) -> Self {
        Self {
            folder,
            guard: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.folder.exists(DESCRIPTOR_CACHE_FILE) {
            // Absence is not an error; the file starts empty.
            self.folder.write(DESCRIPTOR_CACHE_FILE, "{}")?;
            return Ok(BTreeMap::new());
        }
        let text = self.folder.read_to_string(DESCRIPTOR_CACHE_FILE)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The cached descriptor for a tenant, or `None` when absent or
    /// unparseable (logged, never an error).
    pub fn fetch(&self, tenant: &str) -> Result<Option<ShellDescriptor>> {
        let _guard = self.guard.lock();
        let map = self.read_map()?;
        let Some(encoded) = map.get(tenant) else {
            return Ok(None);
        };
        match decode_snapshot(encoded) {
            Some(descriptor) => Ok(Some(descriptor)),
            None => {
                tracing::warn!(tenant, entry = %encoded, "unparseable descriptor cache entry ignored");
                Ok(None)
            }
        }
    }

    pub fn store(&self, tenant: &str, descriptor: &ShellDescriptor) -> Result<()> {
        let _guard = self.guard.lock();
        let mut map = self.read_map()?;
        map.insert(tenant.to_string(), encode_snapshot(descriptor));
        self.folder
            .write(DESCRIPTOR_CACHE_FILE, serde_json::to_string_pretty(&map)?)
    }
}

fn encode_snapshot(descriptor: &ShellDescriptor) -> String {
    let features: String = descriptor
        .features
        .iter()
        .map(|f| format!("{};", f.name))
        .collect();
    format!("{}|{}", descriptor.serial_number, features)
}

fn decode_snapshot(encoded: &str) -> Option<ShellDescriptor> {
    let (serial, features) = encoded.split_once('|')?;
    let serial_number = serial.parse().ok()?;
    let feature_names = features
        .split(';')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Some(ShellDescriptor::new(serial_number, feature_names))
}

/// Per-tenant descriptor authority, resolved inside the shell container.
pub trait ShellDescriptorManager: Send + Sync {
    /// The tenant's current descriptor. When none exists yet, a minimum
    /// descriptor is synthesized from the registered providers, appended to
    /// the log, and returned.
    fn get_shell_descriptor(&self) -> Result<ShellDescriptor>;

    /// Append an updated descriptor. `prior_serial` must equal the current
    /// serial; the log is only ever appended to, never mutated in place.
    fn update_shell_descriptor(
        &self,
        prior_serial: u64,
        features: Vec<ShellFeature>,
    ) -> Result<ShellDescriptor>;
}

/// Contributes feature names every tenant needs at a minimum.
pub trait MinimumDescriptorProvider: Send + Sync {
    fn minimum_features(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> (tempfile::TempDir, Arc<SiteFolder>) {
        let dir = tempfile::tempdir().unwrap();
        let folder = SiteFolder::new(dir.path()).unwrap();
        (dir, folder)
    }

    #[test]
    fn test_log_serials_strictly_increase_across_tenants() {
        let (_dir, folder) = site();
        let log = DescriptorLog::open(&folder).unwrap();

        let first = log.append("default", vec!["Warren.Kernel".to_string()]).unwrap();
        let second = log.append("other", vec!["Warren.Kernel".to_string()]).unwrap();
        let third = log
            .append("default", vec!["Warren.Kernel".to_string(), "Blog".to_string()])
            .unwrap();

        assert_eq!(first.serial_number, 1);
        assert_eq!(second.serial_number, 2);
        assert_eq!(third.serial_number, 3);
        assert_eq!(log.current("default").unwrap().serial_number, 3);
        assert_eq!(log.history("default").len(), 2);
    }

    #[test]
    fn test_log_survives_reopen() {
        let (_dir, folder) = site();
        {
            let log = DescriptorLog::open(&folder).unwrap();
            log.append("default", vec!["A".to_string()]).unwrap();
            log.append("default", vec!["A".to_string(), "B".to_string()])
                .unwrap();
        }

        // Restart simulation: a fresh open sees all entries and keeps the
        // serial counter monotonic.
        let log = DescriptorLog::open(&folder).unwrap();
        let current = log.current("default").unwrap();
        assert_eq!(current.serial_number, 2);
        assert_eq!(current.feature_names(), vec!["A", "B"]);

        let next = log.append("default", vec!["A".to_string()]).unwrap();
        assert_eq!(next.serial_number, 3);
    }

    #[test]
    fn test_torn_trailing_record_dropped() {
        let (_dir, folder) = site();
        {
            let log = DescriptorLog::open(&folder).unwrap();
            log.append("default", vec!["A".to_string()]).unwrap();
        }
        // Simulate a torn write: a frame header promising more bytes than
        // were flushed.
        {
            use std::io::Write;
            let path = folder.map_path(DESCRIPTOR_LOG_FILE).unwrap();
            let mut file = OpenOptions::new().append(true).open(path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let log = DescriptorLog::open(&folder).unwrap();
        assert_eq!(log.current("default").unwrap().serial_number, 1);
        // The torn bytes are gone; appends land on a clean frame boundary.
        let next = log.append("default", vec!["B".to_string()]).unwrap();
        assert_eq!(next.serial_number, 2);
        drop(log);
        let reopened = DescriptorLog::open(&folder).unwrap();
        assert_eq!(reopened.history("default").len(), 2);
    }

    #[test]
    fn test_snapshot_encoding() {
        let descriptor = ShellDescriptor::new(5, vec!["Warren.Kernel".to_string(), "Blog".to_string()]);
        let encoded = encode_snapshot(&descriptor);
        assert_eq!(encoded, "5|Warren.Kernel;Blog;");
        assert_eq!(decode_snapshot(&encoded), Some(descriptor));
        assert!(decode_snapshot("garbage").is_none());
    }

    #[test]
    fn test_cache_fetch_and_store() {
        let (_dir, folder) = site();
        let cache = ShellDescriptorCache::new(folder.clone());

        // First access creates the file; absence is not an error.
        assert!(cache.fetch("default").unwrap().is_none());
        assert!(folder.exists(DESCRIPTOR_CACHE_FILE));

        let descriptor = ShellDescriptor::new(3, vec!["Warren.Kernel".to_string()]);
        cache.store("default", &descriptor).unwrap();
        assert_eq!(cache.fetch("default").unwrap(), Some(descriptor));
        assert!(cache.fetch("other").unwrap().is_none());
    }
}
