//! In-memory simulated camera.
//!
//! `VirtualCamera` implements [`Transport`] by decoding the containers the engine sends and
//! queueing the containers a real camera would answer with. Clones share state, so a test can
//! hand one clone to the engine and keep another to populate storages, inject faults and
//! inspect what went over the wire.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::codes::{ContainerType, ObjectFormat, OperationCode, ResponseCode};
use super::container::{self, Container};
use super::datasets::{self, DeviceInfo, ObjectInfo, StorageInfo, STORAGE_REMOVABLE_RAM};
use super::operations::WIRE_ROOT_PARENT;
use crate::ignore_poison::IgnorePoison;
use crate::store::FileType;
use crate::transport::{Transport, TransportError};

pub const CFEXPRESS_STORAGE_ID: u32 = 0x0001_0001;
pub const SD_STORAGE_ID: u32 = 0x0002_0001;

const ALL_STORAGES: u32 = 0xFFFF_FFFF;

/// One-shot misbehaviour applied to the next command with a matching operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this response code instead of executing the operation.
    Respond(ResponseCode),
    /// Answer OK but with a different transaction id.
    MismatchTransactionId,
    /// Answer with a container whose type field is garbage.
    MalformedResponse,
    /// Never answer; the next receive times out.
    NoResponse,
    /// Drop the link.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct VirtualObject {
    pub info: ObjectInfo,
    pub data: Vec<u8>,
}

struct PendingUpload {
    handle: u32,
    info: ObjectInfo,
}

struct CameraState {
    device_info: DeviceInfo,
    connected: bool,
    session_open: bool,
    storages: BTreeMap<u32, StorageInfo>,
    objects: BTreeMap<u32, VirtualObject>,
    next_handle: u32,
    /// Bytes from the host not yet forming a complete container.
    outbound: Vec<u8>,
    /// A command waiting for its data phase.
    awaiting_data: Option<Container>,
    pending_upload: Option<PendingUpload>,
    inbound: VecDeque<Vec<u8>>,
    max_chunk: usize,
    faults: Vec<(OperationCode, Fault)>,
    commands: Vec<(OperationCode, u32)>,
    sends: usize,
}

#[derive(Clone)]
pub struct VirtualCamera {
    state: Arc<Mutex<CameraState>>,
}

impl Default for VirtualCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCamera {
    /// A camera with no storages that supports every operation this crate issues.
    pub fn new() -> Self {
        let operations = [
            OperationCode::GetDeviceInfo,
            OperationCode::OpenSession,
            OperationCode::CloseSession,
            OperationCode::GetStorageIds,
            OperationCode::GetStorageInfo,
            OperationCode::GetNumObjects,
            OperationCode::GetObjectHandles,
            OperationCode::GetObjectInfo,
            OperationCode::GetObject,
            OperationCode::DeleteObject,
            OperationCode::SendObjectInfo,
            OperationCode::SendObject,
            OperationCode::FormatStore,
            OperationCode::GetPartialObject,
        ];
        let device_info = DeviceInfo {
            standard_version: 100,
            vendor_extension_id: 0x0000_000B,
            vendor_extension_version: 100,
            functional_mode: 0,
            operations_supported: operations.iter().map(|op| op.code()).collect(),
            manufacturer: "Canon Inc.".to_string(),
            model: "Canon EOS R5".to_string(),
            device_version: "1.8.1".to_string(),
            serial_number: "VIRTUAL0001".to_string(),
            ..DeviceInfo::default()
        };
        Self {
            state: Arc::new(Mutex::new(CameraState {
                device_info,
                connected: true,
                session_open: false,
                storages: BTreeMap::new(),
                objects: BTreeMap::new(),
                next_handle: 1,
                outbound: Vec::new(),
                awaiting_data: None,
                pending_upload: None,
                inbound: VecDeque::new(),
                max_chunk: usize::MAX,
                faults: Vec::new(),
                commands: Vec::new(),
                sends: 0,
            })),
        }
    }

    /// A camera with an empty CFexpress card (512 GiB) and an empty SD card (128 GiB).
    pub fn with_two_cards() -> Self {
        let camera = Self::new();
        camera.add_storage(CFEXPRESS_STORAGE_ID, removable_card("CFexpress", 512 << 30, 400 << 30));
        camera.add_storage(SD_STORAGE_ID, removable_card("SD", 128 << 30, 100 << 30));
        camera
    }

    pub fn set_device_info(&self, info: DeviceInfo) {
        self.state.lock_ignore_poison().device_info = info;
    }

    pub fn add_storage(&self, storage_id: u32, info: StorageInfo) {
        self.state.lock_ignore_poison().storages.insert(storage_id, info);
    }

    /// Removes a storage and every object on it, as if the card were pulled.
    pub fn remove_storage(&self, storage_id: u32) {
        let mut state = self.state.lock_ignore_poison();
        state.storages.remove(&storage_id);
        state.objects.retain(|_, object| object.info.storage_id != storage_id);
    }

    pub fn set_read_only(&self, storage_id: u32, read_only: bool) {
        if let Some(storage) = self.state.lock_ignore_poison().storages.get_mut(&storage_id) {
            storage.access_capability = u16::from(read_only);
        }
    }

    /// Adds a file. `parent` is 0 for the storage root.
    pub fn add_file(&self, storage_id: u32, parent: u32, name: &str, data: &[u8]) -> u32 {
        let format = FileType::detect(name).object_format();
        let mut info = ObjectInfo::for_upload(storage_id, parent, name, format, data.len() as u32);
        let now = datasets::parse_ptp_date(&datasets::format_ptp_date(Utc::now()));
        info.capture_date = now;
        info.modification_date = now;
        self.insert(info, data.to_vec())
    }

    pub fn add_folder(&self, storage_id: u32, parent: u32, name: &str) -> u32 {
        let mut info = ObjectInfo::for_upload(storage_id, parent, name, ObjectFormat::Association, 0);
        info.association_type = 0x0001;
        self.insert(info, Vec::new())
    }

    fn insert(&self, info: ObjectInfo, data: Vec<u8>) -> u32 {
        let mut state = self.state.lock_ignore_poison();
        let handle = state.allocate_handle();
        state.objects.insert(handle, VirtualObject { info, data });
        handle
    }

    pub fn set_modified(&self, handle: u32, date: DateTime<Utc>) {
        if let Some(object) = self.state.lock_ignore_poison().objects.get_mut(&handle) {
            object.info.modification_date = Some(date);
        }
    }

    pub fn set_pixel_size(&self, handle: u32, width: u32, height: u32) {
        if let Some(object) = self.state.lock_ignore_poison().objects.get_mut(&handle) {
            object.info.image_pix_width = width;
            object.info.image_pix_height = height;
        }
    }

    pub fn object(&self, handle: u32) -> Option<VirtualObject> {
        self.state.lock_ignore_poison().objects.get(&handle).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock_ignore_poison().objects.len()
    }

    /// Arms a one-shot fault for the next `operation` command.
    pub fn inject_fault(&self, operation: OperationCode, fault: Fault) {
        self.state.lock_ignore_poison().faults.push((operation, fault));
    }

    /// Drops the link: every following send/receive fails with `Disconnected`.
    pub fn disconnect(&self) {
        self.state.lock_ignore_poison().connected = false;
    }

    /// Splits every inbound transfer into chunks of at most `bytes`.
    pub fn set_max_chunk(&self, bytes: usize) {
        self.state.lock_ignore_poison().max_chunk = bytes.max(1);
    }

    /// Every command received so far, with its transaction id.
    pub fn commands(&self) -> Vec<(OperationCode, u32)> {
        self.state.lock_ignore_poison().commands.clone()
    }

    pub fn count_commands(&self, operation: OperationCode) -> usize {
        self.commands().iter().filter(|(op, _)| *op == operation).count()
    }

    /// Number of `send` calls, including ones that carried only a data header or payload.
    pub fn send_count(&self) -> usize {
        self.state.lock_ignore_poison().sends
    }

    pub fn session_open(&self) -> bool {
        self.state.lock_ignore_poison().session_open
    }
}

pub fn removable_card(description: &str, capacity: u64, free: u64) -> StorageInfo {
    StorageInfo {
        storage_type: STORAGE_REMOVABLE_RAM,
        filesystem_type: 0x0003,
        access_capability: 0,
        max_capacity: capacity,
        free_space_bytes: free,
        free_space_images: (free / (40 << 20)) as u32,
        description: description.to_string(),
        volume_label: "EOS_DIGITAL".to_string(),
    }
}

impl Transport for VirtualCamera {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock_ignore_poison();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.sends += 1;
        state.outbound.extend_from_slice(bytes);

        while let Some(length) = container::peek_length(&state.outbound) {
            if state.outbound.len() < length {
                break;
            }
            let frame: Vec<u8> = state.outbound.drain(..length).collect();
            let incoming = Container::decode(&frame).map_err(|e| TransportError::Io { message: e.to_string() })?;
            state.accept(incoming);
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock_ignore_poison();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let limit = max_len.min(state.max_chunk);
        let Some(mut chunk) = state.inbound.pop_front() else {
            return Err(TransportError::Timeout);
        };
        if chunk.len() > limit {
            let rest = chunk.split_off(limit);
            state.inbound.push_front(rest);
        }
        Ok(chunk)
    }
}

type Reply = Result<(Vec<u32>, Option<Bytes>), ResponseCode>;

impl CameraState {
    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn accept(&mut self, incoming: Container) {
        match incoming.kind {
            ContainerType::Command => {
                let operation = OperationCode::from_code(incoming.code);
                self.commands.push((operation, incoming.transaction_id));
                if matches!(operation, OperationCode::SendObjectInfo | OperationCode::SendObject) {
                    self.awaiting_data = Some(incoming);
                } else {
                    self.dispatch(operation, &incoming, None);
                }
            }
            ContainerType::Data => {
                let Some(command) = self.awaiting_data.take() else {
                    return;
                };
                if command.transaction_id != incoming.transaction_id {
                    self.respond(ResponseCode::InvalidTransactionId, command.transaction_id, &[]);
                    return;
                }
                let operation = OperationCode::from_code(command.code);
                self.dispatch(operation, &command, Some(incoming.payload));
            }
            _ => {}
        }
    }

    fn take_fault(&mut self, operation: OperationCode) -> Option<Fault> {
        let index = self.faults.iter().position(|(op, _)| *op == operation)?;
        Some(self.faults.remove(index).1)
    }

    fn dispatch(&mut self, operation: OperationCode, command: &Container, data: Option<Bytes>) {
        let tid = command.transaction_id;
        match self.take_fault(operation) {
            Some(Fault::Respond(code)) => return self.respond(code, tid, &[]),
            Some(Fault::MismatchTransactionId) => return self.respond(ResponseCode::Ok, tid.wrapping_add(100), &[]),
            Some(Fault::MalformedResponse) => {
                let mut frame = Container::response(ResponseCode::Ok.code(), tid, &[]).encode().unwrap_or_default().to_vec();
                frame[4] = 0x07;
                self.inbound.push_back(frame);
                return;
            }
            Some(Fault::NoResponse) => return,
            Some(Fault::Disconnect) => {
                self.connected = false;
                return;
            }
            None => {}
        }

        match self.execute(operation, &command.params, data) {
            Ok((params, payload)) => {
                if let Some(payload) = payload {
                    self.push(Container::data(operation.code(), tid, payload));
                }
                self.respond(ResponseCode::Ok, tid, &params);
            }
            Err(code) => self.respond(code, tid, &[]),
        }
    }

    fn respond(&mut self, code: ResponseCode, tid: u32, params: &[u32]) {
        self.push(Container::response(code.code(), tid, params));
    }

    fn push(&mut self, container: Container) {
        if let Ok(bytes) = container.encode() {
            self.inbound.push_back(bytes.to_vec());
        }
    }

    fn execute(&mut self, operation: OperationCode, params: &[u32], data: Option<Bytes>) -> Reply {
        let param = |i: usize| params.get(i).copied().unwrap_or(0);

        match operation {
            OperationCode::GetDeviceInfo => return Ok((vec![], Some(self.device_info.encode()))),
            OperationCode::OpenSession => {
                if param(0) == 0 {
                    return Err(ResponseCode::InvalidParameter);
                }
                if self.session_open {
                    return Err(ResponseCode::SessionAlreadyOpen);
                }
                self.session_open = true;
                return Ok((vec![], None));
            }
            _ => {}
        }
        if !self.session_open {
            return Err(ResponseCode::SessionNotOpen);
        }

        match operation {
            OperationCode::CloseSession => {
                self.session_open = false;
                Ok((vec![], None))
            }
            OperationCode::GetStorageIds => {
                let ids: Vec<u32> = self.storages.keys().copied().collect();
                Ok((vec![], Some(datasets::encode_u32_array(&ids))))
            }
            OperationCode::GetStorageInfo => {
                let info = self.storages.get(&param(0)).ok_or(ResponseCode::InvalidStorageId)?;
                Ok((vec![], Some(info.encode())))
            }
            OperationCode::GetNumObjects => {
                let (storage, format) = (param(0), param(1));
                self.check_storage(storage)?;
                let count = self
                    .objects
                    .values()
                    .filter(|o| storage == ALL_STORAGES || o.info.storage_id == storage)
                    .filter(|o| format == 0 || u32::from(o.info.format.code()) == format)
                    .count();
                Ok((vec![count as u32], None))
            }
            OperationCode::GetObjectHandles => {
                let (storage, parent) = (param(0), param(2));
                self.check_storage(storage)?;
                if parent != 0 && parent != WIRE_ROOT_PARENT && !self.objects.contains_key(&parent) {
                    return Err(ResponseCode::InvalidParentObject);
                }
                let handles: Vec<u32> = self
                    .objects
                    .iter()
                    .filter(|(_, o)| storage == ALL_STORAGES || o.info.storage_id == storage)
                    .filter(|(_, o)| match parent {
                        0 => true,
                        WIRE_ROOT_PARENT => o.info.parent == 0,
                        p => o.info.parent == p,
                    })
                    .map(|(h, _)| *h)
                    .collect();
                Ok((vec![], Some(datasets::encode_u32_array(&handles))))
            }
            OperationCode::GetObjectInfo => {
                let object = self.objects.get(&param(0)).ok_or(ResponseCode::InvalidObjectHandle)?;
                let mut info = object.info.clone();
                info.compressed_size = object.data.len() as u32;
                Ok((vec![], Some(info.encode())))
            }
            OperationCode::GetObject => {
                let object = self.objects.get(&param(0)).ok_or(ResponseCode::InvalidObjectHandle)?;
                Ok((vec![], Some(Bytes::copy_from_slice(&object.data))))
            }
            OperationCode::GetPartialObject => {
                let object = self.objects.get(&param(0)).ok_or(ResponseCode::InvalidObjectHandle)?;
                let start = (param(1) as usize).min(object.data.len());
                let end = start.saturating_add(param(2) as usize).min(object.data.len());
                let slice = Bytes::copy_from_slice(&object.data[start..end]);
                Ok((vec![slice.len() as u32], Some(slice)))
            }
            OperationCode::DeleteObject => {
                let handle = param(0);
                let object = self.objects.get(&handle).ok_or(ResponseCode::InvalidObjectHandle)?;
                let storage_id = object.info.storage_id;
                if object.info.protection_status != 0 {
                    return Err(ResponseCode::ObjectWriteProtected);
                }
                self.check_writable(storage_id)?;
                let freed = self.remove_tree(handle);
                if let Some(storage) = self.storages.get_mut(&storage_id) {
                    storage.free_space_bytes = (storage.free_space_bytes + freed).min(storage.max_capacity);
                }
                Ok((vec![], None))
            }
            OperationCode::SendObjectInfo => {
                let (storage_id, parent) = (param(0), param(1));
                let data = data.ok_or(ResponseCode::NoValidObjectInfo)?;
                let mut info = ObjectInfo::parse(&data).map_err(|_| ResponseCode::NoValidObjectInfo)?;
                self.check_storage(storage_id)?;
                self.check_writable(storage_id)?;
                let parent = if parent == WIRE_ROOT_PARENT { 0 } else { parent };
                if parent != 0 && !self.objects.get(&parent).is_some_and(|o| o.info.is_folder()) {
                    return Err(ResponseCode::InvalidParentObject);
                }
                let free = self.storages.get(&storage_id).map_or(0, |s| s.free_space_bytes);
                if u64::from(info.compressed_size) > free {
                    return Err(ResponseCode::StoreFull);
                }
                info.storage_id = storage_id;
                info.parent = parent;
                if info.modification_date.is_none() {
                    info.modification_date = datasets::parse_ptp_date(&datasets::format_ptp_date(Utc::now()));
                }
                let handle = self.allocate_handle();
                if info.is_folder() {
                    self.objects.insert(handle, VirtualObject { info, data: Vec::new() });
                } else {
                    self.pending_upload = Some(PendingUpload { handle, info });
                }
                Ok((vec![storage_id, parent, handle], None))
            }
            OperationCode::SendObject => {
                let upload = self.pending_upload.take().ok_or(ResponseCode::NoValidObjectInfo)?;
                let data = data.unwrap_or_default();
                if let Some(storage) = self.storages.get_mut(&upload.info.storage_id) {
                    storage.free_space_bytes = storage.free_space_bytes.saturating_sub(data.len() as u64);
                }
                self.objects.insert(
                    upload.handle,
                    VirtualObject {
                        info: upload.info,
                        data: data.to_vec(),
                    },
                );
                Ok((vec![], None))
            }
            OperationCode::FormatStore => {
                let storage_id = param(0);
                self.check_storage(storage_id)?;
                self.check_writable(storage_id)?;
                self.objects.retain(|_, o| o.info.storage_id != storage_id);
                if let Some(storage) = self.storages.get_mut(&storage_id) {
                    storage.free_space_bytes = storage.max_capacity;
                }
                Ok((vec![], None))
            }
            _ => Err(ResponseCode::OperationNotSupported),
        }
    }

    fn check_storage(&self, storage_id: u32) -> Result<(), ResponseCode> {
        if storage_id == ALL_STORAGES || self.storages.contains_key(&storage_id) {
            Ok(())
        } else {
            Err(ResponseCode::InvalidStorageId)
        }
    }

    fn check_writable(&self, storage_id: u32) -> Result<(), ResponseCode> {
        match self.storages.get(&storage_id) {
            Some(storage) if storage.is_read_only() => Err(ResponseCode::StoreReadOnly),
            Some(_) => Ok(()),
            None => Err(ResponseCode::InvalidStorageId),
        }
    }

    /// Removes an object and its descendants, returning the bytes freed.
    fn remove_tree(&mut self, handle: u32) -> u64 {
        let children: Vec<u32> = self
            .objects
            .iter()
            .filter(|(_, o)| o.info.parent == handle)
            .map(|(h, _)| *h)
            .collect();
        let mut freed: u64 = children.into_iter().map(|child| self.remove_tree(child)).sum();
        if let Some(object) = self.objects.remove(&handle) {
            freed += object.data.len() as u64;
        }
        freed
    }
}
