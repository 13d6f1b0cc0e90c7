//! Object store: the handle index, the content cache and the protocol calls behind them.
//!
//! Lock order is index, then an object's own locks. The index mutex is never held across a
//! protocol exchange; payloads leaving the cache are dropped after it is released.

mod cache;
mod object;

#[cfg(test)]
mod store_test;

pub use object::{CaptureMetadata, FileType, ObjectMetadata, ObjectRef, RemoteObject};

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Timelike, Utc};
use log::{debug, info, warn};

use crate::errors::{StorageError, for_object};
use crate::ignore_poison::{IgnorePoison, IgnorePoisonRw};
use crate::ptp::{DeviceEvent, ObjectInfo, TransactionEngine};
use crate::stats::StorageStats;
use crate::subsystem::Subsystem;
use crate::volumes::{VolumeManager, VolumeObserver};
use cache::ObjectIndex;

/// Handle of the namespace root. Never a real object.
pub const ROOT_HANDLE: u32 = 0;

/// Longest file name accepted for uploads.
pub const MAX_NAME_LEN: usize = 255;

/// Token for a budget applied with [`ObjectStore::override_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetOverride(u64);

#[derive(Default)]
struct BudgetOverrides {
    next_id: u64,
    active: Vec<(u64, u64)>,
}

pub struct ObjectStore {
    engine: Arc<TransactionEngine>,
    volumes: Arc<VolumeManager>,
    stats: Arc<StorageStats>,
    index: Mutex<ObjectIndex>,
    default_budget: u64,
    /// Live budget overrides, oldest first.
    overrides: Mutex<BudgetOverrides>,
    staleness: Duration,
    camera_model: RwLock<Option<String>>,
}

impl ObjectStore {
    pub fn new(
        engine: Arc<TransactionEngine>,
        volumes: Arc<VolumeManager>,
        stats: Arc<StorageStats>,
        budget: u64,
        staleness: Duration,
    ) -> Self {
        Self {
            engine,
            volumes,
            stats,
            index: Mutex::new(ObjectIndex::new(budget)),
            default_budget: budget,
            overrides: Mutex::new(BudgetOverrides::default()),
            staleness,
            camera_model: RwLock::new(None),
        }
    }

    /// Model string attached to the capture metadata of objects fetched from now on.
    pub fn set_camera_model(&self, model: Option<String>) {
        *self.camera_model.write_ignore_poison() = model;
    }

    pub(crate) fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    // ========================================================================
    // Index
    // ========================================================================

    /// Returns the indexed object for `handle` without touching the device.
    pub fn lookup(&self, handle: u32) -> Option<ObjectRef> {
        self.index.lock_ignore_poison().get(handle).cloned()
    }

    /// Fetches an object's metadata from the device and creates or refreshes its index entry.
    ///
    /// A refresh that changes size or modification time drops the cached payload.
    pub fn fetch_info(&self, handle: u32) -> Result<ObjectRef, StorageError> {
        if handle == ROOT_HANDLE {
            return Err(StorageError::invalid_argument("the root has no object"));
        }
        let info = self.engine.get_object_info(handle).map_err(for_object(handle))?;
        let metadata = self.metadata_for(&info);
        if metadata.size_saturated {
            warn!(
                "{} (0x{handle:08X}) is 4 GiB or larger, only its first {} bytes are readable",
                metadata.name, metadata.size
            );
        }

        let (object, stale) = {
            let mut index = self.index.lock_ignore_poison();
            match index.get(handle).cloned() {
                Some(object) => {
                    let stale = if object.refresh(metadata) {
                        index.uncache(handle)
                    } else {
                        None
                    };
                    (object, stale)
                }
                None => {
                    let object = Arc::new(RemoteObject::new(handle, metadata));
                    index.insert(Arc::clone(&object));
                    (object, None)
                }
            }
        };
        if stale.is_some() {
            debug!("Object 0x{handle:08X} changed on the device, dropped its cached content");
        }
        Ok(object)
    }

    fn metadata_for(&self, info: &ObjectInfo) -> ObjectMetadata {
        let slot = self.volumes.slot_for_storage(info.storage_id);
        let model = self.camera_model.read_ignore_poison();
        ObjectMetadata::from_info(info, slot, model.as_deref())
    }

    /// Drops an object from the index without touching the device.
    pub fn forget(&self, handle: u32) -> bool {
        let (object, payload) = self.index.lock_ignore_poison().remove(handle);
        drop(payload);
        object.is_some()
    }

    /// Drops an object's cached payload, keeping its index entry.
    pub fn invalidate(&self, handle: u32) -> bool {
        let payload = self.index.lock_ignore_poison().uncache(handle);
        payload.is_some()
    }

    /// Drops every index entry.
    pub fn clear(&self) {
        let released = self.index.lock_ignore_poison().clear();
        if !released.is_empty() {
            debug!("Released {} cached payload(s)", released.len());
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Reads up to `buf.len()` bytes at `offset`. Serves from the cache when the object is
    /// cached and `offset` lies inside the cached content; otherwise reads that range from the
    /// device without caching it. Returns 0 at or past the end of the object.
    pub fn read_range(&self, object: &RemoteObject, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let handle = object.handle();
        if let Some(payload) = object.cached_payload()
            && offset < payload.len() as u64
        {
            let start = offset as usize;
            let n = buf.len().min(payload.len() - start);
            buf[..n].copy_from_slice(&payload[start..start + n]);
            self.index.lock_ignore_poison().touch(handle);
            self.stats.record_cache_hit(n);
            return Ok(n);
        }

        let size = object.size();
        if offset >= size && object.metadata().size_saturated {
            return Err(StorageError::FileTooLarge { handle });
        }
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let offset = u32::try_from(offset)
            .map_err(|_| StorageError::invalid_argument(format!("offset {offset} is beyond the protocol's range")))?;
        let wanted = (buf.len() as u64).min(size - u64::from(offset)).min(u64::from(u32::MAX)) as u32;

        let started = Instant::now();
        let data = self
            .engine
            .get_partial_object(handle, offset, wanted)
            .map_err(for_object(handle))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.stats.record_cache_miss(n, started.elapsed());
        Ok(n)
    }

    /// Downloads the whole object into the cache as most recently used, evicting older payloads
    /// to stay within the budget. Returns false when the object can't be cached: it is larger
    /// than the whole budget, or it left the index during the download.
    pub fn cache(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        let handle = object.handle();
        {
            let mut index = self.index.lock_ignore_poison();
            if object.is_cached() {
                index.touch(handle);
                return Ok(true);
            }
            if object.size() > index.budget() {
                debug!(
                    "Object 0x{handle:08X} ({} bytes) is larger than the cache budget",
                    object.size()
                );
                return Ok(false);
            }
        }

        let started = Instant::now();
        let payload: Bytes = self.engine.get_object(handle).map_err(for_object(handle))?;
        let len = payload.len();
        self.stats.record_cache_miss(len, started.elapsed());

        let mut released = Vec::new();
        let cached = {
            let mut index = self.index.lock_ignore_poison();
            len as u64 <= index.budget() && index.insert_cached(handle, payload, &mut released)
        };
        if !released.is_empty() {
            debug!("Evicted {} payload(s) to cache 0x{handle:08X}", released.len());
        }
        drop(released);
        Ok(cached)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Uploads a new object into `parent` (0 for the root) on the active volume.
    pub fn write_new(&self, name: &str, bytes: &[u8], parent: u32) -> Result<ObjectRef, StorageError> {
        validate_name(name)?;
        let size = u32::try_from(bytes.len())
            .map_err(|_| StorageError::invalid_argument(format!("{} bytes is too large to upload", bytes.len())))?;
        let volume = self
            .volumes
            .active_volume()
            .ok_or(StorageError::NoSuchDevice { slot: None })?;
        if self.volumes.is_write_protected(volume.slot) {
            return Err(StorageError::ReadOnly);
        }

        let format = FileType::detect(name).object_format();
        let mut info = ObjectInfo::for_upload(volume.storage_id, parent, name, format, size);
        let now = Utc::now();
        info.capture_date = Some(now);
        info.modification_date = Some(now);

        let started = Instant::now();
        let handle = {
            let mut engine = self.engine.exclusive();
            let handle = engine
                .send_object_info(volume.storage_id, parent, &info)
                .map_err(StorageError::from)?;
            engine.send_object(bytes).map_err(for_object(handle))?;
            handle
        };
        self.stats.record_write(bytes.len(), started.elapsed());
        self.volumes.touch(volume.slot);
        info!("Uploaded {name} ({size} bytes) as 0x{handle:08X} to slot {}", volume.slot);

        // Dates travel with whole seconds.
        info.modification_date = info.modification_date.and_then(|d| d.with_nanosecond(0));
        info.capture_date = info.modification_date;
        let object = Arc::new(RemoteObject::new(handle, self.metadata_for(&info)));
        self.index.lock_ignore_poison().insert(Arc::clone(&object));
        Ok(object)
    }

    /// Deletes the object on the device, then drops it from the index and the cache. Nodes that
    /// still hold the object keep a detached copy until they go away.
    pub fn delete(&self, object: &RemoteObject) -> Result<(), StorageError> {
        let handle = object.handle();
        self.engine.delete_object(handle).map_err(for_object(handle))?;
        info!("Deleted 0x{handle:08X} ({})", object.name());
        self.forget(handle);
        Ok(())
    }

    // ========================================================================
    // Budget and cleanup
    // ========================================================================

    /// Drops cached payloads of objects last modified more than the staleness window before
    /// `now`. Objects without a modification time are never stale. Returns how many payloads
    /// were dropped.
    pub fn cleanup_stale(&self, now: DateTime<Utc>) -> usize {
        let Ok(window) = chrono::Duration::from_std(self.staleness) else {
            return 0;
        };
        let cutoff = now - window;
        let released: Vec<Bytes> = {
            let mut index = self.index.lock_ignore_poison();
            let stale: Vec<u32> = index
                .cached_handles()
                .into_iter()
                .filter(|&handle| {
                    index
                        .get(handle)
                        .and_then(|object| object.modified())
                        .is_some_and(|modified| modified < cutoff)
                })
                .collect();
            stale.into_iter().filter_map(|handle| index.uncache(handle)).collect()
        };
        if !released.is_empty() {
            debug!("Cache cleanup dropped {} stale payload(s)", released.len());
        }
        released.len()
    }

    /// Changes the byte budget, evicting to fit.
    pub fn set_budget(&self, bytes: u64) {
        let released = self.index.lock_ignore_poison().set_budget(bytes);
        if !released.is_empty() {
            debug!("Budget change evicted {} payload(s)", released.len());
        }
    }

    /// Restores the budget in force: the most recent live override, or the budget the store
    /// was created with.
    pub fn reset_budget(&self) {
        let overrides = self.overrides.lock_ignore_poison();
        self.set_budget(self.effective_budget(&overrides));
    }

    /// Applies `bytes` as the budget until the returned token is released. With several live
    /// overrides the most recent one applies.
    pub fn override_budget(&self, bytes: u64) -> BudgetOverride {
        let mut overrides = self.overrides.lock_ignore_poison();
        overrides.next_id += 1;
        let id = overrides.next_id;
        overrides.active.push((id, bytes));
        self.set_budget(bytes);
        BudgetOverride(id)
    }

    /// Drops an override. The budget falls back to the newest remaining override, or to the
    /// default once none is left.
    pub fn release_budget_override(&self, token: BudgetOverride) {
        let mut overrides = self.overrides.lock_ignore_poison();
        let before = overrides.active.len();
        overrides.active.retain(|(id, _)| *id != token.0);
        if overrides.active.len() != before {
            self.set_budget(self.effective_budget(&overrides));
        }
    }

    fn effective_budget(&self, overrides: &BudgetOverrides) -> u64 {
        overrides.active.last().map_or(self.default_budget, |(_, bytes)| *bytes)
    }

    pub fn budget(&self) -> u64 {
        self.index.lock_ignore_poison().budget()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.index.lock_ignore_poison().cached_bytes()
    }

    pub fn cached_count(&self) -> usize {
        self.index.lock_ignore_poison().cached_count()
    }

    /// Verifies that the index, the recency list and the cached payloads agree.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.index.lock_ignore_poison().check_consistency()
    }

    fn drop_where(&self, remove_entries: bool, matches: impl Fn(&RemoteObject) -> bool) -> usize {
        let mut index = self.index.lock_ignore_poison();
        let handles: Vec<u32> = index
            .objects()
            .filter(|object| matches(object))
            .map(|object| object.handle())
            .collect();
        let mut released = Vec::with_capacity(handles.len());
        for &handle in &handles {
            if remove_entries {
                let (_, payload) = index.remove(handle);
                released.extend(payload);
            } else {
                released.extend(index.uncache(handle));
            }
        }
        drop(index);
        drop(released);
        handles.len()
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::invalid_argument(format!("{name:?} is not a file name")));
    }
    if name.contains(['/', '\0']) {
        return Err(StorageError::invalid_argument(format!("{name:?} contains a path separator")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StorageError::invalid_argument(format!(
            "name is {} bytes, the limit is {MAX_NAME_LEN}",
            name.len()
        )));
    }
    Ok(())
}

impl VolumeObserver for ObjectStore {
    fn volume_unmounted(&self, slot: usize) {
        let dropped = self.drop_where(false, |object| object.slot() == Some(slot) && object.is_cached());
        debug!("Slot {slot} unmounted, dropped {dropped} cached payload(s)");
    }

    fn volume_formatted(&self, slot: usize) {
        let dropped = self.drop_where(true, |object| object.slot() == Some(slot));
        info!("Slot {slot} formatted, forgot {dropped} object(s)");
    }
}

impl Subsystem for ObjectStore {
    fn name(&self) -> &'static str {
        "objects"
    }

    fn handle_event(&self, event: &DeviceEvent) {
        match *event {
            DeviceEvent::ObjectRemoved { handle } => {
                if self.forget(handle) {
                    debug!("Object 0x{handle:08X} removed on the device");
                }
            }
            DeviceEvent::ObjectInfoChanged { handle } => {
                self.invalidate(handle);
            }
            DeviceEvent::DeviceReset => self.clear(),
            _ => {}
        }
    }

    fn detach(&self) {
        self.clear();
    }
}
