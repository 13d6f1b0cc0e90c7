//! The byte transport the engine runs on.
//!
//! Implementations wrap whatever link the camera is attached through (USB bulk endpoints, a
//! PTP/IP socket, the in-memory virtual device). Both calls block until completion or until the
//! implementation's own timeout fires. The engine never retries a failed call.

use serde::Serialize;

/// Failure of a single send or receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TransportError {
    /// The transfer did not complete within the transport's timeout.
    Timeout,
    /// The link is gone (cable pulled, socket closed).
    Disconnected,
    /// Any other I/O failure.
    Io { message: String },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "transport timed out"),
            Self::Disconnected => write!(f, "transport disconnected"),
            Self::Io { message } => write!(f, "transport I/O error: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => Self::Disconnected,
            _ => Self::Io { message: e.to_string() },
        }
    }
}

/// Ordered, reliable, synchronous delivery of bytes to and from the camera.
pub trait Transport: Send {
    /// Sends `bytes` as one transfer.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Receives at most `max_len` bytes. May return less than a full container; the engine
    /// reassembles containers from the length field.
    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).receive(max_len)
    }
}
