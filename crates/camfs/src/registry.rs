//! Attached cameras by id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::info;
use uuid::Uuid;

use crate::config::CamfsConfig;
use crate::device::CameraDevice;
use crate::errors::StorageError;
use crate::ignore_poison::IgnorePoisonRw;
use crate::transport::Transport;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<CameraDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a camera and returns its new id.
    pub fn attach(&self, transport: impl Transport + 'static, config: CamfsConfig) -> Result<String, StorageError> {
        let device = CameraDevice::attach(transport, config)?;
        Ok(self.insert(device))
    }

    /// Takes ownership of an already attached device.
    pub fn insert(&self, device: CameraDevice) -> String {
        let id = format!("camera-{}", Uuid::new_v4());
        info!("Registered {} as {id}", device.device_info().model);
        self.devices.write_ignore_poison().insert(id.clone(), Arc::new(device));
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<CameraDevice>> {
        self.devices.read_ignore_poison().get(id).cloned()
    }

    /// Detaches and forgets a device. Returns false for an unknown id.
    ///
    /// The device is detached right away even if other holders of its `Arc` remain.
    pub fn detach(&self, id: &str) -> bool {
        let removed = self.devices.write_ignore_poison().remove(id);
        match removed {
            Some(device) => {
                device.detach();
                true
            }
            None => false,
        }
    }

    /// Ids of every attached device, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read_ignore_poison().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.read_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read_ignore_poison().is_empty()
    }

    pub fn detach_all(&self) {
        let devices: Vec<Arc<CameraDevice>> = self.devices.write_ignore_poison().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.detach();
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.detach_all();
    }
}
