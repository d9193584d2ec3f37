/*!
Local filesystem disk storage implementation.
*/

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{DiskStorage, ItemInfo, KeyBuilder, UPLOADS_COMPONENT};
use crate::{Result, SpoolError};

const TMP_SUFFIX: &str = ".tmp";

/// Size limits applied to staged uploads before every write
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageRules {
    /// Hard upper bound of staged bytes
    pub absolute_used_size: u64,
    /// Fraction of the currently free disk space staged uploads may occupy
    pub relative_used_size: f64,
}

impl Default for StorageRules {
    fn default() -> Self {
        Self {
            absolute_used_size: 200 * 1024 * 1024,
            relative_used_size: 0.2,
        }
    }
}

impl StorageRules {
    /// Effective limit given the free space of the volume holding the root
    pub fn limit(&self, available_space: u64) -> u64 {
        let relative = (available_space as f64 * self.relative_used_size.clamp(0.0, 1.0)) as u64;
        self.absolute_used_size.min(relative)
    }
}

/// Disk storage rooted at a directory
///
/// Keys map to nested paths below the root. Every write goes to a hidden
/// temporary file first and is renamed into place, so readers and
/// [`DiskStorage::list`] never see partial items.
///
/// # Example
/// ```rust,no_run
/// use spool_core::storage::{DiskStorage, KeyBuilder, LocalDiskStorage};
///
/// let storage = LocalDiskStorage::new("/var/lib/spool");
/// let key = KeyBuilder::uploads().append("trace").append("payload");
/// storage.insert(b"encoded request", &key)?;
/// # Ok::<(), spool_core::SpoolError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalDiskStorage {
    root: PathBuf,
    rules: StorageRules,
}

impl LocalDiskStorage {
    /// Create a storage rooted at `root` with the default rules
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_rules(root, StorageRules::default())
    }

    pub fn with_rules<P: AsRef<Path>>(root: P, rules: StorageRules) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            rules,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> StorageRules {
        self.rules
    }

    /// Bytes staged below `uploadFiles`, temporary files included
    ///
    /// Session journals and other items outside the uploads tree do not count
    /// against the rules.
    pub fn used_size(&self) -> Result<u64> {
        dir_size(&self.root.join(UPLOADS_COMPONENT))
    }

    fn resolve(&self, key: &KeyBuilder) -> Result<PathBuf> {
        key.validate()?;
        let mut path = self.root.clone();
        for component in key.components() {
            path.push(component);
        }
        Ok(path)
    }

    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SpoolError::storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn check_rules(&self, path: &Path, incoming: u64) -> Result<()> {
        if !path.starts_with(self.root.join(UPLOADS_COMPONENT)) {
            return Ok(());
        }
        let replaced = match fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let used = self.used_size()?.saturating_sub(replaced);
        let available = fs2::available_space(&self.root).map_err(|e| {
            SpoolError::storage(format!(
                "Failed to query free space of {}: {}",
                self.root.display(),
                e
            ))
        })?;
        let limit = self.rules.limit(available);

        if used.saturating_add(incoming) > limit {
            return Err(SpoolError::CapacityExceeded {
                used,
                incoming,
                limit,
            });
        }
        Ok(())
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SpoolError::storage(format!("Invalid path {}", path.display())))?;
        let tmp_path = path.with_file_name(format!(".{file_name}.{}{TMP_SUFFIX}", Uuid::new_v4()));

        fs::write(&tmp_path, data).map_err(|e| {
            SpoolError::storage(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(SpoolError::storage(format!(
                "Failed to move item into {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

impl DiskStorage for LocalDiskStorage {
    fn insert(&self, data: &[u8], key: &KeyBuilder) -> Result<()> {
        let path = self.resolve(key)?;
        self.ensure_parent_dir(&path)?;
        self.check_rules(&path, data.len() as u64)?;
        self.write_atomic(&path, data)?;

        debug!(key = %key, size = data.len(), "Stored item");
        Ok(())
    }

    fn read(&self, key: &KeyBuilder) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpoolError::storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn update(&self, data: &[u8], key: &KeyBuilder) -> Result<()> {
        let path = self.resolve(key)?;
        if !path.is_file() {
            return Err(SpoolError::storage(format!("No item stored under {key}")));
        }
        self.check_rules(&path, data.len() as u64)?;
        self.write_atomic(&path, data)
    }

    fn list(&self, key: &KeyBuilder) -> Result<Vec<ItemInfo>> {
        let dir = self.resolve(key)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SpoolError::storage(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Deleted between read_dir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            items.push(ItemInfo {
                key: name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    fn delete(&self, key: &KeyBuilder) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "Deleted item");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn exists(&self, key: &KeyBuilder) -> Result<bool> {
        Ok(self.resolve(key)?.is_file())
    }

    fn final_destination(&self, key: &KeyBuilder) -> Result<PathBuf> {
        self.resolve(key)
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            total = total.saturating_add(dir_size(&entry.path())?);
        } else {
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}
