//! Audio device enumeration and the backend seam

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

use crate::audio::capture::{
    linear_to_mulaw, pump_samples, CaptureGuard, LocalStream, FRAME_BYTES, FRAME_DURATION,
};
use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
}

/// One entry of the device selection list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// Platform audio access
pub trait AudioBackend: Send {
    /// Every device the platform reports, inputs and outputs alike.
    fn enumerate(&self) -> Result<Vec<AudioDeviceInfo>, AudioError>;

    /// Starts a capture on `device_id`, or on the default input when `None`.
    fn open(&self, device_id: Option<&str>) -> Result<LocalStream, AudioError>;
}

/// Keeps audio inputs only
pub fn input_devices(devices: Vec<AudioDeviceInfo>) -> Vec<AudioDeviceInfo> {
    devices
        .into_iter()
        .filter(|d| d.kind == DeviceKind::AudioInput)
        .collect()
}

/// Backend with a fixed device table and silent captures.
///
/// Inside a tokio runtime a capture feeds 20 ms of μ-law silence per frame
/// into its track; outside one it stays idle.
///
/// Clones share the permission switch, so a test can revoke access after
/// handing the backend away.
#[derive(Clone)]
pub struct VirtualBackend {
    devices: Vec<AudioDeviceInfo>,
    denied: Arc<AtomicBool>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::with_devices(vec![
            AudioDeviceInfo {
                id: "virtual:mic".into(),
                label: "Virtual Microphone".into(),
                kind: DeviceKind::AudioInput,
                is_default: true,
            },
            AudioDeviceInfo {
                id: "virtual:line-in".into(),
                label: "Virtual Line In".into(),
                kind: DeviceKind::AudioInput,
                is_default: false,
            },
            AudioDeviceInfo {
                id: "virtual:speakers".into(),
                label: "Virtual Speakers".into(),
                kind: DeviceKind::AudioOutput,
                is_default: true,
            },
        ])
    }

    pub fn with_devices(devices: Vec<AudioDeviceInfo>) -> Self {
        Self {
            devices,
            denied: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates the user granting or revoking microphone permission.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for VirtualBackend {
    fn enumerate(&self) -> Result<Vec<AudioDeviceInfo>, AudioError> {
        Ok(self.devices.clone())
    }

    fn open(&self, device_id: Option<&str>) -> Result<LocalStream, AudioError> {
        let device = match device_id {
            Some(id) => self
                .devices
                .iter()
                .find(|d| d.id == id && d.kind == DeviceKind::AudioInput),
            None => self
                .devices
                .iter()
                .find(|d| d.is_default && d.kind == DeviceKind::AudioInput),
        }
        .ok_or_else(|| {
            AudioError::DeviceNotFound(device_id.unwrap_or("default input").to_string())
        })?;

        if self.denied.load(Ordering::SeqCst) {
            return Err(AudioError::PermissionDenied(device.id.clone()));
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(LocalStream::new(device.id.clone(), CaptureGuard::idle()));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let guard = CaptureGuard::spawn(format!("silence-{}", device.id), move |running| {
            let frame = vec![linear_to_mulaw(0); FRAME_BYTES];
            while running.load(Ordering::Relaxed) {
                if tx.send(frame.clone()).is_err() {
                    break;
                }
                thread::sleep(FRAME_DURATION);
            }
        })?;

        let stream = LocalStream::new(device.id.clone(), guard);
        runtime.spawn(pump_samples(stream.track(), rx));
        Ok(stream)
    }
}
