/*!
Disk storage for staged upload payloads.

This module defines the storage abstraction (port) consumed by the client and
the exporter, and the local filesystem implementation (adapter). Payloads are
addressed by hierarchical [`KeyBuilder`] keys; the upload staging area lives
under `uploadFiles/<file key type>/<request id>`.
*/

pub mod key;
pub mod local;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub use key::{KeyBuilder, UPLOADS_COMPONENT};
pub use local::{LocalDiskStorage, StorageRules};

/// Entry returned by [`DiskStorage::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    /// Last key component of the item (the file name)
    pub key: String,
    /// Size of the stored item in bytes
    pub size: u64,
    /// Last modification time, when the platform reports one
    pub modified: Option<DateTime<Utc>>,
}

/// Key-addressed persistent blob store
///
/// Implementations must make each individual operation atomic: a reader never
/// observes a half-written item, and deleting an absent key succeeds.
#[cfg_attr(test, mockall::automock)]
pub trait DiskStorage: Send + Sync {
    /// Store `data` under `key`, replacing any previous item
    ///
    /// # Errors
    /// * `SpoolError::CapacityExceeded` - if the storage rules reject the write
    /// * `SpoolError::Storage` - if the item cannot be written
    fn insert(&self, data: &[u8], key: &KeyBuilder) -> Result<()>;

    /// Read the item stored under `key`, `None` if there is none
    fn read(&self, key: &KeyBuilder) -> Result<Option<Vec<u8>>>;

    /// Replace an existing item; fails when nothing is stored under `key`
    fn update(&self, data: &[u8], key: &KeyBuilder) -> Result<()>;

    /// List the items stored directly below `key`
    ///
    /// A key with no items yet yields an empty list.
    fn list(&self, key: &KeyBuilder) -> Result<Vec<ItemInfo>>;

    /// Delete the item stored under `key`; deleting an absent item is a no-op
    fn delete(&self, key: &KeyBuilder) -> Result<()>;

    /// Check whether an item is stored under `key`
    fn exists(&self, key: &KeyBuilder) -> Result<bool>;

    /// Resolve `key` to the file that holds (or will hold) its item
    fn final_destination(&self, key: &KeyBuilder) -> Result<PathBuf>;
}

/// Serde helpers layered over the byte-level storage operations
pub trait DiskStorageExt: DiskStorage {
    /// Store `value` as JSON under `key`
    fn insert_value<T: Serialize>(&self, value: &T, key: &KeyBuilder) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.insert(&data, key)
    }

    /// Read and decode a JSON value stored under `key`
    fn read_value<T: DeserializeOwned>(&self, key: &KeyBuilder) -> Result<Option<T>> {
        match self.read(key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Replace an existing JSON value stored under `key`
    fn update_value<T: Serialize>(&self, value: &T, key: &KeyBuilder) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.update(&data, key)
    }
}

impl<S: DiskStorage + ?Sized> DiskStorageExt for S {}
