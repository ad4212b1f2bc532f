use crate::audio::capture::LocalStream;
use crate::audio::device::{input_devices, AudioBackend, AudioDeviceInfo};
use crate::error::AudioError;

/// Lists inputs and opens captures. Hands streams out, never installs them.
pub struct AudioDeviceManager {
    backend: Box<dyn AudioBackend>,
    initial: Option<LocalStream>,
}

impl AudioDeviceManager {
    /// Tries one capture on `device_id` (default input when `None`).
    /// A failure only leaves the manager without an initial stream.
    pub fn new(backend: impl AudioBackend + 'static, device_id: Option<&str>) -> Self {
        let initial = match backend.open(device_id) {
            Ok(stream) => {
                tracing::info!("Local audio ready on {}", stream.device_id());
                Some(stream)
            }
            Err(e) => {
                tracing::warn!("No local audio, continuing data-only: {}", e);
                None
            }
        };

        Self {
            backend: Box::new(backend),
            initial,
        }
    }

    /// The startup capture, if there was one. Yields it once.
    pub fn take_initial_stream(&mut self) -> Option<LocalStream> {
        self.initial.take()
    }

    /// Audio inputs for the device selection list
    pub fn input_devices(&self) -> Result<Vec<AudioDeviceInfo>, AudioError> {
        self.backend.enumerate().map(input_devices)
    }

    /// Opens a new capture pinned to `device_id`.
    pub fn acquire(&self, device_id: &str) -> Result<LocalStream, AudioError> {
        self.backend.open(Some(device_id))
    }
}
