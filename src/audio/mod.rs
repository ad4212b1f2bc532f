//! Audio subsystem module

pub mod capture;
pub mod device;
#[cfg(feature = "cpal")]
pub mod host;
pub mod manager;

pub use capture::{CaptureGuard, LocalStream};
pub use device::{AudioBackend, AudioDeviceInfo, DeviceKind, VirtualBackend};
#[cfg(feature = "cpal")]
pub use host::CpalBackend;
pub use manager::AudioDeviceManager;
