//! Tethered camera storage over PTP.
//!
//! The crate turns a camera's flat, handle-addressed object space into two things: an object
//! store with a bounded content cache, and a hierarchical filesystem surface a mounting layer
//! can drive. Everything sits on a synchronous [`transport::Transport`] supplied by the caller.
//!
//! Layers, leaf first:
//!
//! - [`ptp`]: container codec, datasets, the transaction engine and the session manager.
//! - [`volumes`]: card slots, their status and capacity, mount/unmount/format.
//! - [`store`]: the object index, reference-counted remote objects and the LRU cache.
//! - [`fs`]: directory listing, lookup, read/write/unlink and statfs.
//! - [`device`] and [`registry`]: composition of the above per attached camera.

// Warn on unused code to catch dead code early
#![warn(unused)]
// Warn on unused dependencies to catch platform-specific cfg mismatches
#![warn(unused_crate_dependencies)]
// Warn on redundant path prefixes (e.g., std::sync::Mutex when Mutex is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//noinspection RsUnusedImport
// Silence false positives for dev dependencies used only in benches/ and tests/
#[cfg(test)]
use blake3 as _;
#[cfg(test)]
use criterion as _;
#[cfg(test)]
use rand_core as _;

pub mod config;
pub mod device;
pub mod errors;
pub mod fs;
mod ignore_poison;
pub mod ptp;
pub mod registry;
pub mod stats;
pub mod store;
pub mod subsystem;
mod tasks;
pub mod transport;
pub mod volumes;

pub use config::CamfsConfig;
pub use device::CameraDevice;
pub use errors::StorageError;
pub use fs::{CameraFs, MountOptions};
pub use registry::DeviceRegistry;
pub use transport::{Transport, TransportError};

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
