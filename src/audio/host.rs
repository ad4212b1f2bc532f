//! Platform audio through cpal

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::capture::{encode_pcmu, pump_samples, CaptureGuard, LocalStream};
use crate::audio::device::{AudioBackend, AudioDeviceInfo, DeviceKind};
use crate::error::AudioError;

/// Real input devices of the default cpal host
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn find_input(id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let name = id.strip_prefix("input:").unwrap_or(id);

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::CpalError(e.to_string()))?;

    for device in devices {
        if device.name().ok().as_deref() == Some(name) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

impl AudioBackend for CpalBackend {
    fn enumerate(&self) -> Result<Vec<AudioDeviceInfo>, AudioError> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let inputs = host
            .input_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input.as_ref() == Some(&name),
                    label: name,
                    kind: DeviceKind::AudioInput,
                });
            }
        }

        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                if let Ok(name) = device.name() {
                    devices.push(AudioDeviceInfo {
                        id: format!("output:{}", name),
                        is_default: default_output.as_ref() == Some(&name),
                        label: name,
                        kind: DeviceKind::AudioOutput,
                    });
                }
            }
        }

        Ok(devices)
    }

    fn open(&self, device_id: Option<&str>) -> Result<LocalStream, AudioError> {
        let device = match device_id {
            Some(id) => find_input(id)?,
            None => cpal::default_host()
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into()))?,
        };
        let name = device
            .name()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AudioError::StreamError("capture needs a tokio runtime".into()))?;

        let (encoded_tx, encoded_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let guard = CaptureGuard::spawn(format!("capture-{}", name), move |running| {
            run_capture(device, supported, encoded_tx, running, ready_tx)
        })?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("capture thread exited".into()))??;

        let stream = LocalStream::new(format!("input:{}", name), guard);
        runtime.spawn(pump_samples(stream.track(), encoded_rx));

        tracing::info!("Capturing from {}", stream.device_id());
        Ok(stream)
    }
}

fn capture_error(err: cpal::StreamError) {
    tracing::warn!("Capture stream error: {}", err);
}

fn run_capture(
    device: cpal::Device,
    supported: cpal::SupportedStreamConfig,
    encoded: mpsc::UnboundedSender<Vec<u8>>,
    running: Arc<AtomicBool>,
    ready: std_mpsc::SyncSender<Result<(), AudioError>>,
) {
    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels;
    let rate = config.sample_rate.0;

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = encoded.send(encode_pcmu(data, channels, rate));
            },
            capture_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data
                    .iter()
                    .map(|&s| s as f32 / i16::MAX as f32)
                    .collect();
                let _ = encoded.send(encode_pcmu(&floats, channels, rate));
            },
            capture_error,
            None,
        ),
        other => {
            let _ = ready.send(Err(AudioError::StreamError(format!(
                "unsupported sample format {:?}",
                other
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(AudioError::CpalError(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(AudioError::CpalError(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    // Stream lives on this thread until the guard drops
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(10));
    }
}
