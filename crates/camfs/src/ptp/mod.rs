//! Picture Transfer Protocol: wire format, transactions and sessions.

pub mod codes;
pub mod container;
pub mod datasets;
pub mod engine;
pub mod errors;
pub mod events;
mod operations;
pub mod session;
#[cfg(any(test, feature = "virtual-device"))]
pub mod virtual_device;

pub use codes::{ContainerType, EventCode, ObjectFormat, OperationCode, ResponseCode};
pub use datasets::{DeviceInfo, ObjectInfo, StorageInfo};
pub use engine::{ExclusiveEngine, Response, TransactionEngine};
pub use errors::PtpError;
pub use events::DeviceEvent;
pub use operations::WIRE_ROOT_PARENT;
pub use session::{SESSION_ID, SessionManager, SessionState};
