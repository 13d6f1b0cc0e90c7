//! Asynchronous device events.

use serde::Serialize;

use super::codes::{ContainerType, EventCode};
use super::container::Container;
use super::errors::PtpError;

/// An event container, decoded to what it is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeviceEvent {
    ObjectAdded { handle: u32 },
    ObjectRemoved { handle: u32 },
    ObjectInfoChanged { handle: u32 },
    StoreAdded { storage_id: u32 },
    StoreRemoved { storage_id: u32 },
    StorageInfoChanged { storage_id: u32 },
    StoreFull { storage_id: u32 },
    DeviceReset,
    CaptureComplete,
    Other { code: u16, params: Vec<u32> },
}

impl DeviceEvent {
    /// Decodes a raw event container as read from the interrupt channel.
    pub fn decode(frame: &[u8]) -> Result<Self, PtpError> {
        Self::from_container(&Container::decode(frame)?)
    }

    pub fn from_container(container: &Container) -> Result<Self, PtpError> {
        if container.kind != ContainerType::Event {
            return Err(PtpError::framing(format!("expected an event container, got {}", container.kind)));
        }
        let first = container.params.first().copied();
        let with_param = |build: fn(u32) -> Self| {
            first
                .map(build)
                .ok_or_else(|| PtpError::framing(format!("event 0x{:04X} is missing its parameter", container.code)))
        };

        match EventCode::from_code(container.code) {
            EventCode::ObjectAdded => with_param(|handle| Self::ObjectAdded { handle }),
            EventCode::ObjectRemoved => with_param(|handle| Self::ObjectRemoved { handle }),
            EventCode::ObjectInfoChanged => with_param(|handle| Self::ObjectInfoChanged { handle }),
            EventCode::StoreAdded => with_param(|storage_id| Self::StoreAdded { storage_id }),
            EventCode::StoreRemoved => with_param(|storage_id| Self::StoreRemoved { storage_id }),
            EventCode::StorageInfoChanged => with_param(|storage_id| Self::StorageInfoChanged { storage_id }),
            EventCode::StoreFull => with_param(|storage_id| Self::StoreFull { storage_id }),
            EventCode::DeviceReset => Ok(Self::DeviceReset),
            EventCode::CaptureComplete => Ok(Self::CaptureComplete),
            other => Ok(Self::Other {
                code: other.code(),
                params: container.params.clone(),
            }),
        }
    }
}
