//! Error type for storage and filesystem operations.

use serde::Serialize;

use crate::ptp::{OperationCode, PtpError, ResponseCode};
use crate::transport::TransportError;

/// Outcome of a failed volume, object-store or filesystem call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum StorageError {
    /// No session is open, or the device says it has none.
    NotConnected,
    /// Transport timed out.
    Timeout,
    /// Link to the camera is gone.
    Disconnected,
    /// Other transport failure.
    Transport { message: String },
    /// Malformed or mismatched container.
    Protocol { message: String },
    /// Device is busy (retryable).
    DeviceBusy,
    /// Card is full.
    StorageFull,
    /// The device refused to modify a protected object or store.
    WriteProtected,
    /// Writes are refused locally: the volume is write-protected or mounted read-only.
    ReadOnly,
    /// No object with this handle.
    ObjectNotFound { handle: u32 },
    /// No usable volume: the slot is not in the state the call needs, or none is active.
    NoSuchDevice { slot: Option<usize> },
    /// Slot index outside the volume table.
    InvalidSlot { slot: usize },
    /// Rejected locally: bad handle, oversized parameter, bad mount option.
    InvalidArgument { message: String },
    /// Filesystem node without a backing object, or no entry by that name.
    NoSuchFile { name: String },
    /// The operation is not permitted on this filesystem.
    PermissionDenied { operation: String },
    /// A buffer could not be allocated.
    OutOfMemory { bytes: usize },
    /// The object is 4 GiB or larger; the protocol can't report its size or address content
    /// past that point.
    FileTooLarge { handle: u32 },
    /// Local I/O failed: a settings file or a background thread.
    Io { message: String },
    /// Any other device-reported failure.
    Device { operation: OperationCode, code: ResponseCode },
}

impl StorageError {
    /// Returns true if the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::DeviceBusy)
    }

    /// True for failures decided locally, without the device saying anything.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly
                | Self::NoSuchDevice { .. }
                | Self::InvalidSlot { .. }
                | Self::InvalidArgument { .. }
                | Self::NoSuchFile { .. }
                | Self::PermissionDenied { .. }
                | Self::OutOfMemory { .. }
                | Self::FileTooLarge { .. }
                | Self::Io { .. }
        )
    }

    /// POSIX errno for a mounting layer.
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotConnected => libc::ENOTCONN,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Disconnected => libc::ENODEV,
            Self::Transport { .. } | Self::Io { .. } => libc::EIO,
            Self::Protocol { .. } => libc::EPROTO,
            Self::DeviceBusy => libc::EBUSY,
            Self::StorageFull => libc::ENOSPC,
            Self::WriteProtected | Self::ReadOnly => libc::EROFS,
            Self::ObjectNotFound { .. } | Self::NoSuchFile { .. } => libc::ENOENT,
            Self::NoSuchDevice { .. } => libc::ENODEV,
            Self::InvalidSlot { .. } | Self::InvalidArgument { .. } => libc::EINVAL,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::OutOfMemory { .. } => libc::ENOMEM,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::Device { .. } => libc::EIO,
        }
    }

    pub(crate) fn no_such_file(name: impl Into<String>) -> Self {
        Self::NoSuchFile { name: name.into() }
    }

    pub(crate) fn permission_denied(operation: impl Into<String>) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
        }
    }

    pub(crate) fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "camera is not connected"),
            Self::Timeout => write!(f, "camera did not answer in time"),
            Self::Disconnected => write!(f, "camera disconnected"),
            Self::Transport { message } => write!(f, "transport error: {message}"),
            Self::Protocol { message } => write!(f, "protocol error: {message}"),
            Self::DeviceBusy => write!(f, "camera is busy"),
            Self::StorageFull => write!(f, "card is full"),
            Self::WriteProtected => write!(f, "card or object is write-protected"),
            Self::ReadOnly => write!(f, "read-only filesystem"),
            Self::ObjectNotFound { handle } => write!(f, "object 0x{handle:08X} not found"),
            Self::NoSuchDevice { slot: Some(slot) } => write!(f, "no usable card in slot {slot}"),
            Self::NoSuchDevice { slot: None } => write!(f, "no active card"),
            Self::InvalidSlot { slot } => write!(f, "invalid slot {slot}"),
            Self::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            Self::NoSuchFile { name } => write!(f, "no such file: {name}"),
            Self::PermissionDenied { operation } => write!(f, "{operation} is not permitted"),
            Self::OutOfMemory { bytes } => write!(f, "could not allocate {bytes} bytes"),
            Self::FileTooLarge { handle } => write!(f, "object 0x{handle:08X} is larger than 4 GiB"),
            Self::Io { message } => write!(f, "I/O error: {message}"),
            Self::Device { operation, code } => write!(f, "{operation} failed with {code}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<PtpError> for StorageError {
    fn from(e: PtpError) -> Self {
        match e {
            PtpError::NotConnected => Self::NotConnected,
            PtpError::InvalidArgument { message } => Self::InvalidArgument { message },
            PtpError::Transport { error } => match error {
                TransportError::Timeout => Self::Timeout,
                TransportError::Disconnected => Self::Disconnected,
                TransportError::Io { message } => Self::Transport { message },
            },
            PtpError::Framing { message } | PtpError::InvalidDataset { message } => Self::Protocol { message },
            PtpError::OutOfMemory { bytes } => Self::OutOfMemory { bytes },
            PtpError::Device { operation, code } => map_response_code(operation, code, None),
        }
    }
}

/// Translates a device-reported response code into the closest outcome.
///
/// `handle` names the object the operation was about, for `ObjectNotFound`.
pub(crate) fn map_response_code(operation: OperationCode, code: ResponseCode, handle: Option<u32>) -> StorageError {
    match code {
        ResponseCode::SessionNotOpen => StorageError::NotConnected,
        ResponseCode::DeviceBusy | ResponseCode::CanonDeviceBusy => StorageError::DeviceBusy,
        ResponseCode::StoreFull => StorageError::StorageFull,
        ResponseCode::ObjectWriteProtected | ResponseCode::StoreReadOnly => StorageError::WriteProtected,
        ResponseCode::InvalidObjectHandle => StorageError::ObjectNotFound {
            handle: handle.unwrap_or(0),
        },
        ResponseCode::InvalidStorageId | ResponseCode::StoreNotAvailable => StorageError::NoSuchDevice { slot: None },
        ResponseCode::InvalidParameter | ResponseCode::ParameterNotSupported | ResponseCode::InvalidParentObject => {
            StorageError::InvalidArgument {
                message: format!("{operation} rejected with {code}"),
            }
        }
        ResponseCode::AccessDenied => StorageError::PermissionDenied {
            operation: operation.name().to_string(),
        },
        _ => StorageError::Device { operation, code },
    }
}

/// Like `From<PtpError>`, but fills in the object handle for `ObjectNotFound`.
pub(crate) fn for_object(handle: u32) -> impl Fn(PtpError) -> StorageError {
    move |e| match e {
        PtpError::Device { operation, code } => map_response_code(operation, code, Some(handle)),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(code: ResponseCode) -> PtpError {
        PtpError::Device {
            operation: OperationCode::GetObject,
            code,
        }
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(StorageError::from(device(ResponseCode::StoreFull)), StorageError::StorageFull);
        assert_eq!(
            StorageError::from(device(ResponseCode::ObjectWriteProtected)),
            StorageError::WriteProtected
        );
        assert_eq!(StorageError::from(device(ResponseCode::StoreReadOnly)), StorageError::WriteProtected);
        assert_eq!(StorageError::from(device(ResponseCode::SessionNotOpen)), StorageError::NotConnected);
        assert_eq!(StorageError::from(device(ResponseCode::CanonDeviceBusy)), StorageError::DeviceBusy);
        assert_eq!(
            StorageError::from(device(ResponseCode::GeneralError)),
            StorageError::Device {
                operation: OperationCode::GetObject,
                code: ResponseCode::GeneralError
            }
        );
    }

    #[test]
    fn test_for_object_fills_handle() {
        let err = for_object(0x42)(device(ResponseCode::InvalidObjectHandle));
        assert_eq!(err, StorageError::ObjectNotFound { handle: 0x42 });
    }

    #[test]
    fn test_transport_mapping() {
        let timeout: StorageError = PtpError::Transport {
            error: TransportError::Timeout,
        }
        .into();
        assert_eq!(timeout, StorageError::Timeout);
        assert!(timeout.is_retryable());
        assert!(!timeout.is_local());
    }

    #[test]
    fn test_framing_becomes_protocol() {
        let err: StorageError = PtpError::Framing {
            message: "tid mismatch".to_string(),
        }
        .into();
        assert!(matches!(err, StorageError::Protocol { message } if message == "tid mismatch"));
    }

    #[test]
    fn test_local_errors() {
        assert!(StorageError::ReadOnly.is_local());
        assert!(StorageError::InvalidSlot { slot: 7 }.is_local());
        assert!(!StorageError::StorageFull.is_local());
    }

    #[cfg(unix)]
    #[test]
    fn test_errno() {
        assert_eq!(StorageError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(StorageError::no_such_file("x").errno(), libc::ENOENT);
        assert_eq!(StorageError::permission_denied("mkdir").errno(), libc::EPERM);
        assert_eq!(StorageError::NoSuchDevice { slot: Some(1) }.errno(), libc::ENODEV);
        assert_eq!(StorageError::FileTooLarge { handle: 1 }.errno(), libc::EFBIG);
    }

    #[test]
    fn test_display() {
        assert_eq!(StorageError::InvalidSlot { slot: 3 }.to_string(), "invalid slot 3");
        assert_eq!(
            StorageError::ObjectNotFound { handle: 0x1f }.to_string(),
            "object 0x0000001F not found"
        );
        assert_eq!(StorageError::NoSuchDevice { slot: None }.to_string(), "no active card");
    }

    #[test]
    fn test_serialization_tag() {
        let json = serde_json::to_value(StorageError::NoSuchDevice { slot: Some(0) }).unwrap();
        assert_eq!(json["type"], "noSuchDevice");
        assert_eq!(json["slot"], 0);
    }
}
