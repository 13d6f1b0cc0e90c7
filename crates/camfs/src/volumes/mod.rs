//! Volume manager: the fixed table of storage slots and which one is active.
//!
//! The table and the active-slot designation sit behind one mutex that every call holds for its
//! whole duration, protocol exchanges included, so a refresh can never interleave with a
//! mount or format of the same slot. Observers (the object store) are told about unmount and
//! format after the mutex is released.

mod volume;


pub use volume::{Volume, VolumeKind, VolumeStatus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use log::{debug, info, warn};

use crate::errors::StorageError;
use crate::ignore_poison::{IgnorePoison, IgnorePoisonRw};
use crate::ptp::{DeviceEvent, ObjectFormat, TransactionEngine};
use crate::subsystem::Subsystem;

/// Number of storage slots tracked per device.
pub const MAX_VOLUMES: usize = 2;

/// Receives volume lifecycle changes that invalidate per-volume state elsewhere.
pub trait VolumeObserver: Send + Sync {
    /// The slot was unmounted or its card removed.
    fn volume_unmounted(&self, slot: usize);
    /// The slot was formatted; every object on it is gone.
    fn volume_formatted(&self, slot: usize);
}

struct VolumeTable {
    volumes: [Volume; MAX_VOLUMES],
    active: Option<usize>,
}

impl VolumeTable {
    fn new() -> Self {
        Self {
            volumes: std::array::from_fn(Volume::empty),
            active: None,
        }
    }

    fn reset(&mut self, slot: usize) {
        self.volumes[slot] = Volume::empty(slot);
        if self.active == Some(slot) {
            self.active = None;
        }
    }
}

enum Change {
    Unmounted(usize),
    Formatted(usize),
}

pub struct VolumeManager {
    engine: Arc<TransactionEngine>,
    table: Mutex<VolumeTable>,
    uploads_supported: AtomicBool,
    observers: RwLock<Vec<Weak<dyn VolumeObserver>>>,
}

impl VolumeManager {
    pub fn new(engine: Arc<TransactionEngine>) -> Self {
        Self {
            engine,
            table: Mutex::new(VolumeTable::new()),
            uploads_supported: AtomicBool::new(true),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Devices that can't receive objects report every volume as write-protected. Applies from
    /// the next scan or refresh.
    pub fn set_uploads_supported(&self, supported: bool) {
        self.uploads_supported.store(supported, Ordering::Relaxed);
    }

    pub fn register_observer(&self, observer: Weak<dyn VolumeObserver>) {
        self.observers.write_ignore_poison().push(observer);
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Asks the device for its storages and fills the slot table in storage-id order.
    ///
    /// Returns how many storages were found. A slot that was mounted on the same storage stays
    /// mounted; slots beyond the storages found are reset to empty.
    pub fn scan(&self) -> Result<usize, StorageError> {
        let (found, changes) = {
            let mut table = self.table.lock_ignore_poison();
            let mut storage_ids = self.engine.get_storage_ids()?;
            if storage_ids.len() > MAX_VOLUMES {
                warn!(
                    "Device reports {} storages, tracking the first {MAX_VOLUMES}",
                    storage_ids.len()
                );
                storage_ids.truncate(MAX_VOLUMES);
            }

            let mut changes = Vec::new();
            for (slot, &storage_id) in storage_ids.iter().enumerate() {
                let was_mounted = table.volumes[slot].status.is_mounted();
                let same_storage = table.volumes[slot].storage_id == storage_id;
                if was_mounted && !same_storage {
                    changes.push(Change::Unmounted(slot));
                }

                let volume = &mut table.volumes[slot];
                match self.engine.get_storage_info(storage_id) {
                    Ok(info) => {
                        volume.apply_storage_info(storage_id, &info, self.uploads_supported());
                        self.count_objects(volume);
                        volume.status = if was_mounted && same_storage {
                            volume.mounted_status()
                        } else {
                            VolumeStatus::Inserted
                        };
                    }
                    Err(e) => {
                        warn!("Can't read storage 0x{storage_id:08X} for slot {slot}: {e}");
                        if was_mounted && same_storage {
                            changes.push(Change::Unmounted(slot));
                        }
                        *volume = Volume::empty(slot);
                        volume.storage_id = storage_id;
                        volume.status = VolumeStatus::Error;
                    }
                }
                debug!("Slot {slot}: storage 0x{storage_id:08X} is {}", volume.status);
            }

            for slot in storage_ids.len()..MAX_VOLUMES {
                if table.volumes[slot].status.is_mounted() {
                    changes.push(Change::Unmounted(slot));
                }
                table.reset(slot);
            }
            if let Some(active) = table.active
                && !table.volumes[active].status.is_mounted()
            {
                table.active = None;
            }

            info!("Volume scan found {} storage(s)", storage_ids.len());
            (storage_ids.len(), changes)
        };
        self.notify(changes);
        Ok(found)
    }

    fn count_objects(&self, volume: &mut Volume) {
        let total = self.engine.get_num_objects(volume.storage_id, None);
        let folders = self
            .engine
            .get_num_objects(volume.storage_id, Some(ObjectFormat::Association));
        match (total, folders) {
            (Ok(total), Ok(folders)) => {
                volume.folder_count = folders;
                volume.file_count = total.saturating_sub(folders);
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!("Can't count objects on slot {}: {e}", volume.slot);
                volume.file_count = 0;
                volume.folder_count = 0;
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mounts an inserted volume. The first mounted volume becomes active.
    pub fn mount(&self, slot: usize) -> Result<(), StorageError> {
        check_slot(slot)?;
        let mut table = self.table.lock_ignore_poison();
        let volume = &mut table.volumes[slot];
        if volume.status != VolumeStatus::Inserted {
            return Err(StorageError::NoSuchDevice { slot: Some(slot) });
        }
        volume.status = volume.mounted_status();
        volume.last_access = Some(Utc::now());
        info!("Mounted slot {slot} ({}, {})", volume.kind, volume.label);
        if table.active.is_none() {
            table.active = Some(slot);
            info!("Slot {slot} is now active");
        }
        Ok(())
    }

    /// Resets the slot to empty. Unmounting an empty slot succeeds.
    pub fn unmount(&self, slot: usize) -> Result<(), StorageError> {
        check_slot(slot)?;
        let was_mounted = {
            let mut table = self.table.lock_ignore_poison();
            let was_mounted = table.volumes[slot].status.is_mounted();
            table.reset(slot);
            was_mounted
        };
        if was_mounted {
            info!("Unmounted slot {slot}");
            self.notify(vec![Change::Unmounted(slot)]);
        } else {
            debug!("Slot {slot} was not mounted");
        }
        Ok(())
    }

    /// Formats a mounted volume.
    pub fn format(&self, slot: usize) -> Result<(), StorageError> {
        check_slot(slot)?;
        {
            let mut table = self.table.lock_ignore_poison();
            let volume = &mut table.volumes[slot];
            if !volume.status.is_mounted() {
                return Err(StorageError::NoSuchDevice { slot: Some(slot) });
            }
            info!("Formatting slot {slot} (storage 0x{:08X})", volume.storage_id);
            self.engine.format_store(volume.storage_id)?;
            volume.free_bytes = volume.total_bytes;
            volume.file_count = 0;
            volume.folder_count = 0;
            volume.needs_format = false;
            volume.last_access = Some(Utc::now());
            volume.status = volume.mounted_status();
        }
        self.notify(vec![Change::Formatted(slot)]);
        Ok(())
    }

    /// Re-reads capacity and counts of every mounted slot. A storage the device no longer knows
    /// is treated as removed. Returns how many slots were refreshed.
    pub fn refresh_mounted(&self) -> usize {
        let mut refreshed = 0;
        let mut changes = Vec::new();
        {
            let mut table = self.table.lock_ignore_poison();
            for slot in 0..MAX_VOLUMES {
                if !table.volumes[slot].status.is_mounted() {
                    continue;
                }
                match self.refresh_slot(&mut table.volumes[slot]) {
                    Ok(()) => refreshed += 1,
                    Err(StorageError::NoSuchDevice { .. }) => {
                        info!("Storage behind slot {slot} is gone");
                        table.reset(slot);
                        changes.push(Change::Unmounted(slot));
                    }
                    Err(e) => warn!("Refreshing slot {slot} failed: {e}"),
                }
            }
        }
        self.notify(changes);
        refreshed
    }

    fn refresh_slot(&self, volume: &mut Volume) -> Result<(), StorageError> {
        let info = self.engine.get_storage_info(volume.storage_id)?;
        volume.apply_storage_info(volume.storage_id, &info, self.uploads_supported());
        self.count_objects(volume);
        volume.status = volume.mounted_status();
        Ok(())
    }

    /// Applies a card status reported by the device. Insertion rescans and mounts; removal
    /// unmounts.
    pub fn handle_card_event(&self, slot: usize, status: VolumeStatus) -> Result<(), StorageError> {
        check_slot(slot)?;
        info!("Card event on slot {slot}: {status}");
        match status {
            VolumeStatus::Inserted | VolumeStatus::Mounted => {
                self.scan()?;
                if self.volume(slot)?.status == VolumeStatus::Inserted {
                    self.mount(slot)?;
                }
                Ok(())
            }
            VolumeStatus::Empty => self.unmount(slot),
            VolumeStatus::Full => {
                let mut table = self.table.lock_ignore_poison();
                let volume = &mut table.volumes[slot];
                volume.free_bytes = 0;
                if volume.status.is_mounted() && !volume.write_protected {
                    volume.status = VolumeStatus::Full;
                }
                Ok(())
            }
            VolumeStatus::WriteProtected => {
                let mut table = self.table.lock_ignore_poison();
                let volume = &mut table.volumes[slot];
                volume.write_protected = true;
                if volume.status.is_mounted() {
                    volume.status = VolumeStatus::WriteProtected;
                }
                Ok(())
            }
            VolumeStatus::Error => {
                let was_mounted = {
                    let mut table = self.table.lock_ignore_poison();
                    let was_mounted = table.volumes[slot].status.is_mounted();
                    table.volumes[slot].status = VolumeStatus::Error;
                    if table.active == Some(slot) {
                        table.active = None;
                    }
                    was_mounted
                };
                if was_mounted {
                    self.notify(vec![Change::Unmounted(slot)]);
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Makes a mounted slot the root of the filesystem namespace.
    pub fn set_active(&self, slot: usize) -> Result<(), StorageError> {
        check_slot(slot)?;
        let mut table = self.table.lock_ignore_poison();
        if !table.volumes[slot].status.is_mounted() {
            return Err(StorageError::NoSuchDevice { slot: Some(slot) });
        }
        table.active = Some(slot);
        table.volumes[slot].last_access = Some(Utc::now());
        info!("Slot {slot} is now active");
        Ok(())
    }

    pub fn active_slot(&self) -> Option<usize> {
        self.table.lock_ignore_poison().active
    }

    pub fn active_volume(&self) -> Option<Volume> {
        let table = self.table.lock_ignore_poison();
        table.active.map(|slot| table.volumes[slot].clone())
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.table.lock_ignore_poison().volumes.to_vec()
    }

    pub fn volume(&self, slot: usize) -> Result<Volume, StorageError> {
        check_slot(slot)?;
        Ok(self.table.lock_ignore_poison().volumes[slot].clone())
    }

    /// True when writes to the slot must be refused. Slots outside the table count as
    /// protected.
    pub fn is_write_protected(&self, slot: usize) -> bool {
        if slot >= MAX_VOLUMES {
            return true;
        }
        self.table.lock_ignore_poison().volumes[slot].write_protected
    }

    pub fn free_space(&self, slot: usize) -> Result<u64, StorageError> {
        Ok(self.volume(slot)?.free_bytes)
    }

    /// Slot currently holding `storage_id`, if any.
    pub fn slot_for_storage(&self, storage_id: u32) -> Option<usize> {
        if storage_id == 0 {
            return None;
        }
        let table = self.table.lock_ignore_poison();
        table.volumes.iter().position(|volume| volume.storage_id == storage_id)
    }

    /// Records an access on a slot without touching the device.
    pub(crate) fn touch(&self, slot: usize) {
        if slot < MAX_VOLUMES {
            self.table.lock_ignore_poison().volumes[slot].last_access = Some(Utc::now());
        }
    }

    /// Unmounts every slot, for device teardown.
    pub fn unmount_all(&self) {
        for slot in 0..MAX_VOLUMES {
            let _ = self.unmount(slot);
        }
    }

    fn uploads_supported(&self) -> bool {
        self.uploads_supported.load(Ordering::Relaxed)
    }

    fn notify(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn VolumeObserver>> = self
            .observers
            .read_ignore_poison()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for change in &changes {
            for observer in &observers {
                match *change {
                    Change::Unmounted(slot) => observer.volume_unmounted(slot),
                    Change::Formatted(slot) => observer.volume_formatted(slot),
                }
            }
        }
    }

    fn on_device_event(&self, event: &DeviceEvent) -> Result<(), StorageError> {
        match *event {
            DeviceEvent::StoreAdded { storage_id } => {
                self.scan()?;
                match self.slot_for_storage(storage_id) {
                    Some(slot) if self.volume(slot)?.status == VolumeStatus::Inserted => self.mount(slot),
                    _ => Ok(()),
                }
            }
            DeviceEvent::StoreRemoved { storage_id } => match self.slot_for_storage(storage_id) {
                Some(slot) => self.handle_card_event(slot, VolumeStatus::Empty),
                None => Ok(()),
            },
            DeviceEvent::StoreFull { storage_id } => match self.slot_for_storage(storage_id) {
                Some(slot) => self.handle_card_event(slot, VolumeStatus::Full),
                None => Ok(()),
            },
            DeviceEvent::StorageInfoChanged { .. } => {
                self.refresh_mounted();
                Ok(())
            }
            DeviceEvent::DeviceReset => self.scan().map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl Subsystem for VolumeManager {
    fn name(&self) -> &'static str {
        "volumes"
    }

    fn handle_event(&self, event: &DeviceEvent) {
        if let Err(e) = self.on_device_event(event) {
            warn!("Volume manager couldn't handle {event:?}: {e}");
        }
    }

    fn detach(&self) {
        self.unmount_all();
    }
}

fn check_slot(slot: usize) -> Result<(), StorageError> {
    if slot < MAX_VOLUMES {
        Ok(())
    } else {
        Err(StorageError::InvalidSlot { slot })
    }
}
