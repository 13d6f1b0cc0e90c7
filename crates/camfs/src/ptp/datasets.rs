//! DeviceInfo, StorageInfo and ObjectInfo datasets.
//!
//! Datasets travel in data containers. Their primitives are little-endian integers, arrays
//! (u32 count followed by elements) and strings (u8 count of UCS-2 code units including the
//! terminating NUL, then the code units). Dates are strings of the form `YYYYMMDDThhmmss`
//! with an optional `.s` tenths suffix and an optional `Z` or `±hhmm` offset.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use super::codes::{ObjectFormat, OperationCode};
use super::errors::PtpError;

/// Longest string a dataset can carry, in UCS-2 code units, excluding the NUL.
const MAX_STRING_UNITS: usize = 254;

const DATE_FORMAT: &str = "%Y%m%dT%H%M%S";

// ============================================================================
// Primitive reader / writer
// ============================================================================

pub(crate) struct DatasetReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> DatasetReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, bytes: usize, field: &str) -> Result<(), PtpError> {
        if self.buf.remaining() < bytes {
            return Err(PtpError::dataset(format!(
                "{} truncated at {field}: need {bytes} bytes, have {}",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self, field: &str) -> Result<u8, PtpError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self, field: &str) -> Result<u16, PtpError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn u32(&mut self, field: &str) -> Result<u32, PtpError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self, field: &str) -> Result<u64, PtpError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn string(&mut self, field: &str) -> Result<String, PtpError> {
        let units = self.u8(field)? as usize;
        self.need(units * 2, field)?;
        let mut chars: Vec<u16> = (0..units).map(|_| self.buf.get_u16_le()).collect();
        while chars.last() == Some(&0) {
            chars.pop();
        }
        Ok(String::from_utf16_lossy(&chars))
    }

    pub(crate) fn u16_array(&mut self, field: &str) -> Result<Vec<u16>, PtpError> {
        let count = self.u32(field)? as usize;
        self.need(count.saturating_mul(2), field)?;
        Ok((0..count).map(|_| self.buf.get_u16_le()).collect())
    }

    pub(crate) fn u32_array(&mut self, field: &str) -> Result<Vec<u32>, PtpError> {
        let count = self.u32(field)? as usize;
        self.need(count.saturating_mul(4), field)?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }

    pub(crate) fn date(&mut self, field: &str) -> Result<Option<DateTime<Utc>>, PtpError> {
        Ok(parse_ptp_date(&self.string(field)?))
    }
}

#[derive(Default)]
pub(crate) struct DatasetWriter {
    buf: BytesMut,
}

impl DatasetWriter {
    pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub(crate) fn string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().take(MAX_STRING_UNITS).collect();
        if units.is_empty() {
            self.buf.put_u8(0);
            return self;
        }
        self.buf.put_u8((units.len() + 1) as u8);
        for unit in units {
            self.buf.put_u16_le(unit);
        }
        self.buf.put_u16_le(0);
        self
    }

    pub(crate) fn u16_array(&mut self, values: &[u16]) -> &mut Self {
        self.buf.put_u32_le(values.len() as u32);
        for value in values {
            self.buf.put_u16_le(*value);
        }
        self
    }

    pub(crate) fn u32_array(&mut self, values: &[u32]) -> &mut Self {
        self.buf.put_u32_le(values.len() as u32);
        for value in values {
            self.buf.put_u32_le(*value);
        }
        self
    }

    pub(crate) fn date(&mut self, value: Option<DateTime<Utc>>) -> &mut Self {
        match value {
            Some(date) => self.string(&format_ptp_date(date)),
            None => self.string(""),
        }
    }

    pub(crate) fn finish(&mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }
}

/// Parses a PTP date string. Dates without an offset are taken as UTC.
pub fn parse_ptp_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.len() < 15 || !value.is_char_boundary(15) {
        return None;
    }
    let (base, mut rest) = value.split_at(15);
    let naive = NaiveDateTime::parse_from_str(base, DATE_FORMAT).ok()?;

    // Tenths of a second are allowed but not kept.
    if let Some(stripped) = rest.strip_prefix('.') {
        rest = stripped.trim_start_matches(|c: char| c.is_ascii_digit());
    }

    match rest {
        "" | "Z" => Some(Utc.from_utc_datetime(&naive)),
        offset if offset.len() == 5 && offset.is_ascii() && (offset.starts_with('+') || offset.starts_with('-')) => {
            let hours: i32 = offset[1..3].parse().ok()?;
            let minutes: i32 = offset[3..5].parse().ok()?;
            let seconds = (hours * 3600 + minutes * 60) * if offset.starts_with('-') { -1 } else { 1 };
            let tz = FixedOffset::east_opt(seconds)?;
            tz.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

pub fn format_ptp_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// Identity and capabilities reported by `GetDeviceInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, PtpError> {
        let mut r = DatasetReader::new(payload, "DeviceInfo");
        Ok(Self {
            standard_version: r.u16("StandardVersion")?,
            vendor_extension_id: r.u32("VendorExtensionID")?,
            vendor_extension_version: r.u16("VendorExtensionVersion")?,
            vendor_extension_desc: r.string("VendorExtensionDesc")?,
            functional_mode: r.u16("FunctionalMode")?,
            operations_supported: r.u16_array("OperationsSupported")?,
            events_supported: r.u16_array("EventsSupported")?,
            device_properties_supported: r.u16_array("DevicePropertiesSupported")?,
            capture_formats: r.u16_array("CaptureFormats")?,
            image_formats: r.u16_array("ImageFormats")?,
            manufacturer: r.string("Manufacturer")?,
            model: r.string("Model")?,
            device_version: r.string("DeviceVersion")?,
            serial_number: r.string("SerialNumber")?,
        })
    }

    pub fn encode(&self) -> Bytes {
        DatasetWriter::default()
            .u16(self.standard_version)
            .u32(self.vendor_extension_id)
            .u16(self.vendor_extension_version)
            .string(&self.vendor_extension_desc)
            .u16(self.functional_mode)
            .u16_array(&self.operations_supported)
            .u16_array(&self.events_supported)
            .u16_array(&self.device_properties_supported)
            .u16_array(&self.capture_formats)
            .u16_array(&self.image_formats)
            .string(&self.manufacturer)
            .string(&self.model)
            .string(&self.device_version)
            .string(&self.serial_number)
            .finish()
    }

    pub fn supports(&self, operation: OperationCode) -> bool {
        self.operations_supported.contains(&operation.code())
    }

    /// Whether uploads are possible at all (both halves of the send handshake present).
    pub fn supports_upload(&self) -> bool {
        self.supports(OperationCode::SendObjectInfo) && self.supports(OperationCode::SendObject)
    }
}

// ============================================================================
// StorageInfo
// ============================================================================

pub const STORAGE_FIXED_ROM: u16 = 0x0001;
pub const STORAGE_REMOVABLE_ROM: u16 = 0x0002;
pub const STORAGE_FIXED_RAM: u16 = 0x0003;
pub const STORAGE_REMOVABLE_RAM: u16 = 0x0004;

pub const ACCESS_READ_WRITE: u16 = 0x0000;

/// Capacity and identity of one storage, as reported by `GetStorageInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_images: u32,
    pub description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, PtpError> {
        let mut r = DatasetReader::new(payload, "StorageInfo");
        Ok(Self {
            storage_type: r.u16("StorageType")?,
            filesystem_type: r.u16("FilesystemType")?,
            access_capability: r.u16("AccessCapability")?,
            max_capacity: r.u64("MaxCapacity")?,
            free_space_bytes: r.u64("FreeSpaceInBytes")?,
            free_space_images: r.u32("FreeSpaceInImages")?,
            description: r.string("StorageDescription")?,
            volume_label: r.string("VolumeLabel")?,
        })
    }

    pub fn encode(&self) -> Bytes {
        DatasetWriter::default()
            .u16(self.storage_type)
            .u16(self.filesystem_type)
            .u16(self.access_capability)
            .u64(self.max_capacity)
            .u64(self.free_space_bytes)
            .u32(self.free_space_images)
            .string(&self.description)
            .string(&self.volume_label)
            .finish()
    }

    pub fn is_read_only(&self) -> bool {
        self.access_capability != ACCESS_READ_WRITE
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.storage_type, STORAGE_FIXED_ROM | STORAGE_FIXED_RAM)
    }

    /// Human-readable filesystem name for the `FilesystemType` field.
    pub fn filesystem_name(&self) -> &'static str {
        match self.filesystem_type {
            0x0001 => "generic-flat",
            0x0002 => "generic-hierarchical",
            0x0003 => "DCF",
            _ => "unknown",
        }
    }
}

// ============================================================================
// ObjectInfo
// ============================================================================

/// `ObjectCompressedSize` value meaning "4 GiB or larger".
pub const SIZE_UNKNOWN_LARGE: u32 = 0xFFFF_FFFF;

/// Metadata of one object, as reported by `GetObjectInfo` or sent with `SendObjectInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub format: ObjectFormat,
    pub protection_status: u16,
    pub compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    /// 0 for objects in the storage root.
    pub parent: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: Option<DateTime<Utc>>,
    pub modification_date: Option<DateTime<Utc>>,
    pub keywords: String,
}

impl ObjectInfo {
    /// Minimal info for an upload of `size` bytes named `filename`.
    pub fn for_upload(storage_id: u32, parent: u32, filename: &str, format: ObjectFormat, size: u32) -> Self {
        Self {
            storage_id,
            format,
            protection_status: 0,
            compressed_size: size,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent,
            association_type: 0,
            association_desc: 0,
            sequence_number: 0,
            filename: filename.to_string(),
            capture_date: None,
            modification_date: None,
            keywords: String::new(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PtpError> {
        let mut r = DatasetReader::new(payload, "ObjectInfo");
        Ok(Self {
            storage_id: r.u32("StorageID")?,
            format: ObjectFormat::from_code(r.u16("ObjectFormat")?),
            protection_status: r.u16("ProtectionStatus")?,
            compressed_size: r.u32("ObjectCompressedSize")?,
            thumb_format: r.u16("ThumbFormat")?,
            thumb_compressed_size: r.u32("ThumbCompressedSize")?,
            thumb_pix_width: r.u32("ThumbPixWidth")?,
            thumb_pix_height: r.u32("ThumbPixHeight")?,
            image_pix_width: r.u32("ImagePixWidth")?,
            image_pix_height: r.u32("ImagePixHeight")?,
            image_bit_depth: r.u32("ImageBitDepth")?,
            parent: r.u32("ParentObject")?,
            association_type: r.u16("AssociationType")?,
            association_desc: r.u32("AssociationDesc")?,
            sequence_number: r.u32("SequenceNumber")?,
            filename: r.string("Filename")?,
            capture_date: r.date("CaptureDate")?,
            modification_date: r.date("ModificationDate")?,
            keywords: r.string("Keywords")?,
        })
    }

    pub fn encode(&self) -> Bytes {
        DatasetWriter::default()
            .u32(self.storage_id)
            .u16(self.format.code())
            .u16(self.protection_status)
            .u32(self.compressed_size)
            .u16(self.thumb_format)
            .u32(self.thumb_compressed_size)
            .u32(self.thumb_pix_width)
            .u32(self.thumb_pix_height)
            .u32(self.image_pix_width)
            .u32(self.image_pix_height)
            .u32(self.image_bit_depth)
            .u32(self.parent)
            .u16(self.association_type)
            .u32(self.association_desc)
            .u32(self.sequence_number)
            .string(&self.filename)
            .date(self.capture_date)
            .date(self.modification_date)
            .string(&self.keywords)
            .finish()
    }

    pub fn is_folder(&self) -> bool {
        self.format == ObjectFormat::Association
    }
}

/// Parses the u32 array carried by `GetStorageIDs` and `GetObjectHandles`.
pub fn parse_u32_array(payload: &[u8], what: &'static str) -> Result<Vec<u32>, PtpError> {
    DatasetReader::new(payload, what).u32_array(what)
}

pub fn encode_u32_array(values: &[u32]) -> Bytes {
    DatasetWriter::default().u32_array(values).finish()
}
