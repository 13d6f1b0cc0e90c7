//! Capability interface for the parts of a device that react to its lifecycle.
//!
//! The volume manager and object store register themselves when a device attaches. Capture
//! pipelines or other collaborators living outside this crate can register their own
//! implementation through [`crate::CameraDevice::register_subsystem`].

use crate::ptp::DeviceEvent;

pub trait Subsystem: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Called on the device's event thread for every device event, in arrival order.
    fn handle_event(&self, _event: &DeviceEvent) {}

    /// Called once while the device detaches, after background tasks have stopped and before
    /// the session closes.
    fn detach(&self) {}
}
