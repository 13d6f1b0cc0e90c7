//! Error type for protocol exchanges.

use serde::Serialize;

use super::codes::{OperationCode, ResponseCode};
use crate::transport::TransportError;

/// Failure of one engine call.
///
/// The variants keep the failure surfaces apart: local rejections never touched the wire,
/// transport and framing failures are about the link, and `Device` carries the camera's own
/// verdict for the caller to translate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PtpError {
    /// No session is open and the operation is not `OpenSession`.
    NotConnected,
    /// Rejected locally before any exchange (too many parameters, oversized payload).
    InvalidArgument { message: String },
    /// Send or receive failed.
    Transport { error: TransportError },
    /// Malformed container, wrong container type or transaction id mismatch.
    Framing { message: String },
    /// A dataset in a data phase could not be parsed.
    InvalidDataset { message: String },
    /// The device answered with a non-OK response code.
    Device { operation: OperationCode, code: ResponseCode },
    /// A receive buffer of this size could not be allocated.
    OutOfMemory { bytes: usize },
}

impl PtpError {
    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Self::Framing { message: message.into() }
    }

    pub(crate) fn dataset(message: impl Into<String>) -> Self {
        Self::InvalidDataset { message: message.into() }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// The device-reported response code, if this is a device failure.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for PtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "no PTP session is open"),
            Self::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
            Self::Transport { error } => write!(f, "{error}"),
            Self::Framing { message } => write!(f, "protocol framing error: {message}"),
            Self::InvalidDataset { message } => write!(f, "invalid dataset: {message}"),
            Self::Device { operation, code } => write!(f, "{operation} failed with {code}"),
            Self::OutOfMemory { bytes } => write!(f, "could not allocate {bytes} bytes"),
        }
    }
}

impl std::error::Error for PtpError {}

impl From<TransportError> for PtpError {
    fn from(error: TransportError) -> Self {
        Self::Transport { error }
    }
}
