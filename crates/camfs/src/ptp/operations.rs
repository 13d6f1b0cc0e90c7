//! Typed wrappers over [`TransactionEngine::execute`] for the operations this crate issues.

use bytes::Bytes;

use super::codes::{ObjectFormat, OperationCode};
use super::datasets::{self, DeviceInfo, ObjectInfo, StorageInfo};
use super::engine::{ExclusiveEngine, TransactionEngine};
use super::errors::PtpError;

/// Parent value on the wire meaning "objects in the storage root".
pub const WIRE_ROOT_PARENT: u32 = 0xFFFF_FFFF;

/// Our root sentinel is 0; GetObjectHandles and SendObjectInfo spell it 0xFFFFFFFF.
fn wire_parent(parent: u32) -> u32 {
    if parent == 0 { WIRE_ROOT_PARENT } else { parent }
}

impl TransactionEngine {
    pub fn get_device_info(&self) -> Result<DeviceInfo, PtpError> {
        let response = self.execute_ok(OperationCode::GetDeviceInfo, &[], None)?;
        DeviceInfo::parse(response.expect_data()?)
    }

    pub fn get_storage_ids(&self) -> Result<Vec<u32>, PtpError> {
        let response = self.execute_ok(OperationCode::GetStorageIds, &[], None)?;
        datasets::parse_u32_array(response.expect_data()?, "StorageIDs")
    }

    pub fn get_storage_info(&self, storage_id: u32) -> Result<StorageInfo, PtpError> {
        let response = self.execute_ok(OperationCode::GetStorageInfo, &[storage_id], None)?;
        StorageInfo::parse(response.expect_data()?)
    }

    /// Counts objects on a storage, optionally only of one format. Counts the whole storage,
    /// not just the root.
    pub fn get_num_objects(&self, storage_id: u32, format: Option<ObjectFormat>) -> Result<u32, PtpError> {
        let format = format.map_or(0, ObjectFormat::code) as u32;
        let response = self.execute_ok(OperationCode::GetNumObjects, &[storage_id, format, 0], None)?;
        response
            .param(0)
            .ok_or_else(|| PtpError::framing("GetNumObjects response carried no count"))
    }

    /// Handles of the direct children of `parent` (0 for the storage root).
    pub fn get_object_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<u32>, PtpError> {
        let response = self.execute_ok(
            OperationCode::GetObjectHandles,
            &[storage_id, 0, wire_parent(parent)],
            None,
        )?;
        datasets::parse_u32_array(response.expect_data()?, "ObjectHandles")
    }

    pub fn get_object_info(&self, handle: u32) -> Result<ObjectInfo, PtpError> {
        let response = self.execute_ok(OperationCode::GetObjectInfo, &[handle], None)?;
        ObjectInfo::parse(response.expect_data()?)
    }

    /// Downloads a whole object.
    pub fn get_object(&self, handle: u32) -> Result<Bytes, PtpError> {
        let response = self.execute_ok(OperationCode::GetObject, &[handle], None)?;
        Ok(response.data.unwrap_or_default())
    }

    /// Downloads up to `max_bytes` starting at `offset`.
    pub fn get_partial_object(&self, handle: u32, offset: u32, max_bytes: u32) -> Result<Bytes, PtpError> {
        let response = self.execute_ok(OperationCode::GetPartialObject, &[handle, offset, max_bytes], None)?;
        Ok(response.data.unwrap_or_default())
    }

    pub fn delete_object(&self, handle: u32) -> Result<(), PtpError> {
        self.execute_ok(OperationCode::DeleteObject, &[handle, 0], None)?;
        Ok(())
    }

    pub fn format_store(&self, storage_id: u32) -> Result<(), PtpError> {
        self.execute_ok(OperationCode::FormatStore, &[storage_id], None)?;
        Ok(())
    }
}

// The device pairs SendObject with the preceding SendObjectInfo, so uploads run on the locked
// engine with nothing in between.
impl ExclusiveEngine<'_> {
    /// First half of an upload. Returns the handle the device assigned.
    pub fn send_object_info(&mut self, storage_id: u32, parent: u32, info: &ObjectInfo) -> Result<u32, PtpError> {
        let dataset = info.encode();
        let response = self.execute_ok(
            OperationCode::SendObjectInfo,
            &[storage_id, wire_parent(parent)],
            Some(&dataset),
        )?;
        response
            .param(2)
            .ok_or_else(|| PtpError::framing("SendObjectInfo response carried no object handle"))
    }

    /// Second half of an upload: the object's bytes.
    pub fn send_object(&mut self, bytes: &[u8]) -> Result<(), PtpError> {
        self.execute_ok(OperationCode::SendObject, &[], Some(bytes))?;
        Ok(())
    }
}
