//! Per-slot volume records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ptp::StorageInfo;

/// Kind of storage behind a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeKind {
    None,
    CfExpress,
    Sd,
    Internal,
}

impl VolumeKind {
    /// Classifies a storage. Fixed storages are internal; removable ones are told apart by the
    /// physical store number in the high half of the id (1 is the CFexpress bay).
    pub fn classify(storage_id: u32, info: &StorageInfo) -> Self {
        if info.is_fixed() {
            Self::Internal
        } else if storage_id >> 16 == 1 {
            Self::CfExpress
        } else {
            Self::Sd
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::CfExpress => "CFexpress Type B",
            Self::Sd => "SD Card",
            Self::Internal => "Internal Storage",
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeStatus {
    Empty,
    Inserted,
    Mounted,
    Error,
    WriteProtected,
    Full,
}

impl VolumeStatus {
    /// Mounted, possibly with a condition (full or write-protected) noted on top.
    pub fn is_mounted(self) -> bool {
        matches!(self, Self::Mounted | Self::WriteProtected | Self::Full)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Inserted => "Inserted",
            Self::Mounted => "Mounted",
            Self::Error => "Error",
            Self::WriteProtected => "Write Protected",
            Self::Full => "Full",
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of one storage slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub slot: usize,
    /// 0 when the slot is empty.
    pub storage_id: u32,
    pub kind: VolumeKind,
    pub status: VolumeStatus,
    pub label: String,
    pub description: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub filesystem: String,
    /// 0 when the device does not report it.
    pub cluster_size: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub last_access: Option<DateTime<Utc>>,
    pub write_protected: bool,
    pub needs_format: bool,
}

impl Volume {
    pub fn empty(slot: usize) -> Self {
        Self {
            slot,
            storage_id: 0,
            kind: VolumeKind::None,
            status: VolumeStatus::Empty,
            label: String::new(),
            description: String::new(),
            total_bytes: 0,
            free_bytes: 0,
            filesystem: String::new(),
            cluster_size: 0,
            file_count: 0,
            folder_count: 0,
            last_access: None,
            write_protected: false,
            needs_format: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status == VolumeStatus::Empty
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Copies capacity and identity from a storage dataset.
    pub(crate) fn apply_storage_info(&mut self, storage_id: u32, info: &StorageInfo, uploads_supported: bool) {
        self.storage_id = storage_id;
        self.kind = VolumeKind::classify(storage_id, info);
        self.label = if info.volume_label.is_empty() {
            info.description.clone()
        } else {
            info.volume_label.clone()
        };
        self.description = info.description.clone();
        self.total_bytes = info.max_capacity;
        self.free_bytes = info.free_space_bytes.min(info.max_capacity);
        self.filesystem = info.filesystem_name().to_string();
        self.write_protected = info.is_read_only() || !uploads_supported;
        self.needs_format = info.filesystem_type == 0 && info.max_capacity > 0;
    }

    /// Status of a mounted volume given its current condition.
    pub(crate) fn mounted_status(&self) -> VolumeStatus {
        if self.write_protected {
            VolumeStatus::WriteProtected
        } else if self.total_bytes > 0 && self.free_bytes == 0 {
            VolumeStatus::Full
        } else {
            VolumeStatus::Mounted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::datasets::{STORAGE_FIXED_RAM, STORAGE_REMOVABLE_RAM};

    fn storage(storage_type: u16, read_only: bool) -> StorageInfo {
        StorageInfo {
            storage_type,
            filesystem_type: 0x0003,
            access_capability: u16::from(read_only),
            max_capacity: 1000,
            free_space_bytes: 400,
            free_space_images: 0,
            description: "Card".to_string(),
            volume_label: String::new(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            VolumeKind::classify(0x0001_0001, &storage(STORAGE_REMOVABLE_RAM, false)),
            VolumeKind::CfExpress
        );
        assert_eq!(
            VolumeKind::classify(0x0002_0001, &storage(STORAGE_REMOVABLE_RAM, false)),
            VolumeKind::Sd
        );
        assert_eq!(
            VolumeKind::classify(0x0001_0001, &storage(STORAGE_FIXED_RAM, false)),
            VolumeKind::Internal
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(VolumeKind::CfExpress.to_string(), "CFexpress Type B");
        assert_eq!(VolumeKind::None.to_string(), "None");
        assert_eq!(VolumeStatus::WriteProtected.to_string(), "Write Protected");
    }

    #[test]
    fn test_apply_storage_info() {
        let mut volume = Volume::empty(0);
        volume.apply_storage_info(0x0001_0001, &storage(STORAGE_REMOVABLE_RAM, false), true);
        assert_eq!(volume.label, "Card");
        assert_eq!(volume.total_bytes, 1000);
        assert_eq!(volume.used_bytes(), 600);
        assert_eq!(volume.filesystem, "DCF");
        assert!(!volume.write_protected);
        assert!(!volume.needs_format);
        assert_eq!(volume.mounted_status(), VolumeStatus::Mounted);
    }

    #[test]
    fn test_write_protection_sources() {
        let mut volume = Volume::empty(1);
        volume.apply_storage_info(0x0002_0001, &storage(STORAGE_REMOVABLE_RAM, true), true);
        assert!(volume.write_protected);
        assert_eq!(volume.mounted_status(), VolumeStatus::WriteProtected);

        volume.apply_storage_info(0x0002_0001, &storage(STORAGE_REMOVABLE_RAM, false), false);
        assert!(volume.write_protected);
    }

    #[test]
    fn test_full_status() {
        let mut volume = Volume::empty(0);
        let mut info = storage(STORAGE_REMOVABLE_RAM, false);
        info.free_space_bytes = 0;
        volume.apply_storage_info(0x0001_0001, &info, true);
        assert_eq!(volume.mounted_status(), VolumeStatus::Full);
        assert!(VolumeStatus::Full.is_mounted());
        assert!(!VolumeStatus::Inserted.is_mounted());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(Volume::empty(1)).unwrap();
        assert_eq!(json["status"], "empty");
        assert_eq!(json["totalBytes"], 0);
        assert_eq!(json["kind"], "none");
    }
}
