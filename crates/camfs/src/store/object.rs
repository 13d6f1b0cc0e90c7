//! Remote objects and their metadata.

use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ignore_poison::{IgnorePoison, IgnorePoisonRw};
use crate::ptp::{ObjectFormat, ObjectInfo};

/// Shared reference to a remote object. The index holds one; each filesystem node holds one.
pub type ObjectRef = Arc<RemoteObject>;

/// Content type of an object, from its extension or protocol format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    Unknown,
    Jpeg,
    RawCr3,
    RawCr2,
    Heif,
    Mov,
    Mp4,
    Wav,
    Folder,
}

impl FileType {
    /// Detects the type from a file name's extension, case-insensitively.
    pub fn detect(name: &str) -> Self {
        let Some((_, extension)) = name.rsplit_once('.') else {
            return Self::Unknown;
        };
        match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "cr3" => Self::RawCr3,
            "cr2" => Self::RawCr2,
            "heic" | "heif" => Self::Heif,
            "mov" => Self::Mov,
            "mp4" => Self::Mp4,
            "wav" => Self::Wav,
            _ => Self::Unknown,
        }
    }

    /// Type of an object the device described. Folders are recognized by format; files by
    /// extension first, then by format.
    pub fn from_format(format: ObjectFormat, name: &str) -> Self {
        if format == ObjectFormat::Association {
            return Self::Folder;
        }
        match Self::detect(name) {
            Self::Unknown => match format {
                ObjectFormat::ExifJpeg => Self::Jpeg,
                ObjectFormat::CanonCr3 => Self::RawCr3,
                ObjectFormat::CanonCr2 => Self::RawCr2,
                ObjectFormat::CanonHeif => Self::Heif,
                ObjectFormat::QuickTime | ObjectFormat::CanonMov => Self::Mov,
                ObjectFormat::Mp4 => Self::Mp4,
                ObjectFormat::Wav => Self::Wav,
                _ => Self::Unknown,
            },
            detected => detected,
        }
    }

    /// Protocol format code used when uploading an object of this type.
    pub fn object_format(self) -> ObjectFormat {
        match self {
            Self::Unknown => ObjectFormat::Undefined,
            Self::Jpeg => ObjectFormat::ExifJpeg,
            Self::RawCr3 => ObjectFormat::CanonCr3,
            Self::RawCr2 => ObjectFormat::CanonCr2,
            Self::Heif => ObjectFormat::CanonHeif,
            Self::Mov => ObjectFormat::QuickTime,
            Self::Mp4 => ObjectFormat::Mp4,
            Self::Wav => ObjectFormat::Wav,
            Self::Folder => ObjectFormat::Association,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Jpeg => "JPEG",
            Self::RawCr3 => "RAW CR3",
            Self::RawCr2 => "RAW CR2",
            Self::Heif => "HEIF",
            Self::Mov => "MOV",
            Self::Mp4 => "MP4",
            Self::Wav => "WAV",
            Self::Folder => "Folder",
        }
    }

    /// Images and videos carry capture metadata.
    pub fn has_capture_metadata(self) -> bool {
        matches!(
            self,
            Self::Jpeg | Self::RawCr3 | Self::RawCr2 | Self::Heif | Self::Mov | Self::Mp4
        )
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shooting details for image and video objects. Fields the device does not report stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub width: u32,
    pub height: u32,
    /// Not part of the ObjectInfo dataset. Set with [`RemoteObject::set_exposure_details`] by
    /// callers that read it from the file's own headers.
    pub iso: Option<u32>,
    pub camera_model: Option<String>,
    /// Same source as `iso`.
    pub lens_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// 0 for objects in the storage root.
    pub parent: u32,
    pub storage_id: u32,
    /// Volume slot the object lives on, if the storage is in the slot table.
    pub slot: Option<usize>,
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    /// The device reported the 32-bit maximum: the object is at least `size` bytes and its
    /// real length is unknown.
    pub size_saturated: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// Protection status bits from the device.
    pub attributes: u16,
    pub capture: Option<CaptureMetadata>,
}

impl ObjectMetadata {
    pub fn from_info(info: &ObjectInfo, slot: Option<usize>, camera_model: Option<&str>) -> Self {
        let file_type = FileType::from_format(info.format, &info.filename);
        let capture = file_type.has_capture_metadata().then(|| CaptureMetadata {
            width: info.image_pix_width,
            height: info.image_pix_height,
            iso: None,
            camera_model: camera_model.map(str::to_string),
            lens_model: None,
        });
        Self {
            parent: info.parent,
            storage_id: info.storage_id,
            slot,
            name: info.filename.clone(),
            file_type,
            size: u64::from(info.compressed_size),
            size_saturated: info.compressed_size == u32::MAX,
            created: info.capture_date,
            modified: info.modification_date,
            attributes: info.protection_status,
            capture,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Folder
    }
}

/// One file or folder on the camera.
///
/// The handle never changes. Metadata is refreshed in place by `fetch_info`. The cached
/// payload is only ever set or cleared by the object store while it holds its index lock, so
/// "has a payload" and "is on the recency list" change together.
#[derive(Debug)]
pub struct RemoteObject {
    handle: u32,
    metadata: RwLock<ObjectMetadata>,
    payload: Mutex<Option<Bytes>>,
}

impl RemoteObject {
    pub(crate) fn new(handle: u32, metadata: ObjectMetadata) -> Self {
        Self {
            handle,
            metadata: RwLock::new(metadata),
            payload: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn metadata(&self) -> ObjectMetadata {
        self.metadata.read_ignore_poison().clone()
    }

    pub fn name(&self) -> String {
        self.metadata.read_ignore_poison().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.metadata.read_ignore_poison().size
    }

    pub fn file_type(&self) -> FileType {
        self.metadata.read_ignore_poison().file_type
    }

    pub fn parent(&self) -> u32 {
        self.metadata.read_ignore_poison().parent
    }

    pub fn slot(&self) -> Option<usize> {
        self.metadata.read_ignore_poison().slot
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.metadata.read_ignore_poison().modified
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.read_ignore_poison().is_dir()
    }

    pub fn is_cached(&self) -> bool {
        self.payload.lock_ignore_poison().is_some()
    }

    /// Bytes held in the cache for this object, 0 when not cached.
    pub fn cached_len(&self) -> usize {
        self.payload.lock_ignore_poison().as_ref().map_or(0, Bytes::len)
    }

    pub(crate) fn cached_payload(&self) -> Option<Bytes> {
        self.payload.lock_ignore_poison().clone()
    }

    /// Replaces the metadata. Returns true when size or modification time changed, meaning a
    /// cached payload no longer matches the object.
    ///
    /// ISO and lens model recorded for unchanged content are kept.
    pub(crate) fn refresh(&self, mut metadata: ObjectMetadata) -> bool {
        let mut current = self.metadata.write_ignore_poison();
        let changed = current.size != metadata.size || current.modified != metadata.modified;
        if !changed
            && let (Some(old), Some(new)) = (current.capture.as_ref(), metadata.capture.as_mut())
        {
            new.iso = new.iso.or(old.iso);
            new.lens_model = new.lens_model.take().or_else(|| old.lens_model.clone());
        }
        *current = metadata;
        changed
    }

    /// Records exposure details read from the content itself. Returns false for objects
    /// without capture metadata.
    pub fn set_exposure_details(&self, iso: Option<u32>, lens_model: Option<String>) -> bool {
        match self.metadata.write_ignore_poison().capture.as_mut() {
            Some(capture) => {
                capture.iso = iso;
                capture.lens_model = lens_model;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_payload(&self, payload: Option<Bytes>) -> Option<Bytes> {
        std::mem::replace(&mut *self.payload.lock_ignore_poison(), payload)
    }
}
