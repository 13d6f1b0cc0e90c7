//! Filesystem bridge: the operations a mounting layer calls, expressed over the object store.
//!
//! The namespace root is the active volume's storage root. Listings are recomputed from the
//! device on every call; names are resolved by scanning a listing because the protocol has no
//! lookup by name.

mod node;
mod options;


pub use node::{DIR_MODE, DirectoryEntry, FILE_MODE, FsNode, NodeAttr, NodeKind};
pub use options::MountOptions;

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::StorageError;
use crate::stats::StorageStats;
use crate::store::{BudgetOverride, MAX_NAME_LEN, ObjectStore};
use crate::volumes::{VolumeManager, VolumeStatus};

/// `f_type` reported by statfs.
pub const CAMFS_MAGIC: u32 = 0x4335_5235;
/// `f_ffree` reported by statfs. The device has no inode limit.
pub const FREE_INODES: u64 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatFs {
    pub magic: u32,
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_len: u32,
}

pub struct CameraFs {
    volumes: Arc<VolumeManager>,
    store: Arc<ObjectStore>,
    stats: Arc<StorageStats>,
    options: MountOptions,
    block_size: u32,
    budget_override: Option<BudgetOverride>,
}

impl CameraFs {
    /// Mounts the filesystem on `options.slot`, mounting the volume first if it is only
    /// inserted, and makes that slot active.
    pub fn mount(
        volumes: Arc<VolumeManager>,
        store: Arc<ObjectStore>,
        stats: Arc<StorageStats>,
        options: MountOptions,
        block_size: u32,
    ) -> Result<Self, StorageError> {
        let volume = volumes.volume(options.slot)?;
        match volume.status {
            VolumeStatus::Inserted => volumes.mount(options.slot)?,
            status if status.is_mounted() => {}
            _ => return Err(StorageError::NoSuchDevice { slot: Some(options.slot) }),
        }
        volumes.set_active(options.slot)?;
        let budget_override = options.cache_size.map(|bytes| store.override_budget(bytes));
        info!("Filesystem mounted with {options}");
        Ok(Self {
            volumes,
            store,
            stats,
            options,
            block_size: block_size.max(1),
            budget_override,
        })
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn root(&self) -> FsNode {
        FsNode::root()
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Lists a directory: "." and ".." first, then one entry per child the device reports.
    /// Children whose metadata can't be fetched are skipped.
    pub fn readdir(&self, dir: &FsNode) -> Result<Vec<DirectoryEntry>, StorageError> {
        if !dir.is_dir() {
            return Err(StorageError::invalid_argument(format!("{} is not a directory", dir.name())));
        }
        let volume = self
            .volumes
            .active_volume()
            .ok_or(StorageError::NoSuchDevice { slot: None })?;
        let handles = self
            .store
            .engine()
            .get_object_handles(volume.storage_id, dir.handle())?;

        let parent = dir.object().map_or(dir.handle(), |object| object.parent());
        let mut entries = Vec::with_capacity(handles.len() + 2);
        entries.push(DirectoryEntry::dot(".", dir.handle()));
        entries.push(DirectoryEntry::dot("..", parent));
        for handle in handles {
            match self.store.fetch_info(handle) {
                Ok(object) => entries.push(DirectoryEntry::for_object(&object)),
                Err(e) => warn!("Skipping 0x{handle:08X} in listing of {}: {e}", dir.name()),
            }
        }
        self.volumes.touch(volume.slot);
        debug!("Listed {} ({} entries)", dir.name(), entries.len() - 2);
        Ok(entries)
    }

    /// Resolves `name` inside `dir`.
    pub fn lookup(&self, dir: &FsNode, name: &str) -> Result<FsNode, StorageError> {
        match name {
            "." => return Ok(dir.clone()),
            ".." => return self.parent_of(dir),
            _ => {}
        }
        let entry = self
            .readdir(dir)?
            .into_iter()
            .skip(2)
            .find(|entry| entry.name == name)
            .ok_or_else(|| StorageError::no_such_file(name))?;
        Ok(FsNode::bound(self.store.fetch_info(entry.handle)?))
    }

    fn parent_of(&self, node: &FsNode) -> Result<FsNode, StorageError> {
        match node.object() {
            Some(object) if object.parent() != 0 => Ok(FsNode::bound(self.store.fetch_info(object.parent())?)),
            _ => Ok(FsNode::root()),
        }
    }

    pub fn getattr(&self, node: &FsNode) -> Result<NodeAttr, StorageError> {
        if !node.is_root() && node.object().is_none() {
            return Err(StorageError::no_such_file(node.name()));
        }
        Ok(NodeAttr::of(node))
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at or past the end.
    pub fn read(&self, node: &FsNode, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let object = node.object().ok_or_else(|| StorageError::no_such_file(node.name()))?;
        if object.is_dir() {
            return Err(StorageError::invalid_argument(format!("{} is a directory", object.name())));
        }
        let n = self.store.read_range(object, buf, offset)?;
        if offset == 0 {
            self.stats.record_file_read();
        }
        Ok(n)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Replaces a file's content. The new object is uploaded under the same name and parent,
    /// then the old one is deleted and the node rebound to the new one.
    pub fn write(&self, node: &mut FsNode, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        let old = node.object().cloned().ok_or_else(|| StorageError::no_such_file(node.name()))?;
        if old.is_dir() {
            return Err(StorageError::invalid_argument(format!("{} is a directory", old.name())));
        }
        let new = self.store.write_new(&old.name(), bytes, old.parent())?;
        node.rebind(new);
        if let Err(e) = self.store.delete(&old) {
            warn!(
                "Replaced {} but couldn't delete the previous object 0x{:08X}: {e}",
                old.name(),
                old.handle()
            );
        }
        Ok(())
    }

    /// Writes `bytes` as `name` in `dir`, replacing an existing file of that name.
    pub fn create(&self, dir: &FsNode, name: &str, bytes: &[u8]) -> Result<FsNode, StorageError> {
        self.check_writable()?;
        if name.len() > MAX_NAME_LEN {
            return Err(StorageError::invalid_argument(format!("{name:?} is too long")));
        }
        match self.lookup(dir, name) {
            Ok(mut existing) => {
                self.write(&mut existing, bytes)?;
                Ok(existing)
            }
            Err(StorageError::NoSuchFile { .. }) => {
                let object = self.store.write_new(name, bytes, dir.handle())?;
                Ok(FsNode::bound(object))
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the node's object and leaves the node unbound.
    pub fn unlink(&self, node: &mut FsNode) -> Result<(), StorageError> {
        self.check_writable()?;
        let object = node.object().cloned().ok_or_else(|| StorageError::no_such_file(node.name()))?;
        if object.is_dir() {
            return Err(StorageError::permission_denied("unlink of a directory"));
        }
        self.store.delete(&object)?;
        node.unbind();
        Ok(())
    }

    /// Remote directory creation isn't supported.
    pub fn mkdir(&self, _dir: &FsNode, _name: &str) -> Result<FsNode, StorageError> {
        Err(StorageError::permission_denied("mkdir"))
    }

    /// Remote directory removal isn't supported.
    pub fn rmdir(&self, _dir: &FsNode, _name: &str) -> Result<(), StorageError> {
        Err(StorageError::permission_denied("rmdir"))
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly);
        }
        match self.volumes.active_slot() {
            Some(slot) if self.volumes.is_write_protected(slot) => Err(StorageError::ReadOnly),
            Some(_) => Ok(()),
            None => Err(StorageError::NoSuchDevice { slot: None }),
        }
    }

    // ========================================================================
    // Capacity
    // ========================================================================

    /// Capacity of the active volume in `block_size` units. Counts are zero when no slot is
    /// active.
    pub fn statfs(&self) -> StatFs {
        let mut stat = StatFs {
            magic: CAMFS_MAGIC,
            block_size: self.block_size,
            name_len: MAX_NAME_LEN as u32,
            ..StatFs::default()
        };
        if let Some(volume) = self.volumes.active_volume() {
            let block_size = u64::from(self.block_size);
            stat.blocks = volume.total_bytes / block_size;
            stat.blocks_free = volume.free_bytes / block_size;
            stat.blocks_available = if volume.write_protected { 0 } else { stat.blocks_free };
            stat.files = u64::from(volume.file_count);
            stat.files_free = FREE_INODES;
        }
        stat
    }
}

impl Drop for CameraFs {
    fn drop(&mut self) {
        if let Some(token) = self.budget_override.take() {
            self.store.release_budget_override(token);
        }
        debug!("Filesystem on slot {} released", self.options.slot);
    }
}
