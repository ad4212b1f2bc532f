//! Local capture streams
//!
//! A [`LocalStream`] is one capture of one input device together with the
//! outbound webrtc track it feeds. Clones share the capture; it stops when
//! the last clone is dropped.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::AudioError;
use crate::utils::random_id;

/// Outbound codec clock rate (G.711)
pub const PCMU_SAMPLE_RATE: u32 = 8000;

/// Duration of one outbound sample
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Encoded bytes per outbound sample (one byte per 8 kHz sample)
pub const FRAME_BYTES: usize = (PCMU_SAMPLE_RATE as usize * 20) / 1000;

#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    device_id: String,
    track: Arc<TrackLocalStaticSample>,
    _capture: CaptureGuard,
}

impl LocalStream {
    pub fn new(device_id: impl Into<String>, capture: CaptureGuard) -> Self {
        let id = format!("stream-{}", random_id());
        let track = new_audio_track(&id);
        Self {
            inner: Arc::new(StreamInner {
                id,
                device_id: device_id.into(),
                track,
                _capture: capture,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.track.clone()
    }

    pub fn track_id(&self) -> &str {
        self.inner.track.id()
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("track", &self.track_id())
            .finish()
    }
}

/// Mono PCMU track carrying one capture
pub fn new_audio_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: PCMU_SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        format!("audio-{}", random_id()),
        stream_id.to_owned(),
    ))
}

/// Keeps a capture worker alive; stops it on drop.
///
/// Inside a tokio runtime the join moves to the blocking pool so dropping a
/// stream never stalls a runtime worker; elsewhere it joins in place.
pub struct CaptureGuard {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureGuard {
    /// Guard for a capture with no worker thread (virtual devices).
    pub fn idle() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            worker: None,
        }
    }

    /// Runs `body` on a dedicated thread until the guard drops.
    /// `body` must return soon after the flag it is given turns false.
    pub fn spawn<F>(name: String, body: F) -> Result<Self, AudioError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || body(flag))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = worker.join();
                });
            }
            Err(_) => {
                let _ = worker.join();
            }
        }
    }
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// G.711 μ-law encoding of one 16-bit sample
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Downmixes interleaved f32 frames to mono, decimates to 8 kHz and μ-law encodes.
pub fn encode_pcmu(samples: &[f32], channels: u16, sample_rate: u32) -> Vec<u8> {
    let channels = channels.max(1) as usize;
    let step = (sample_rate / PCMU_SAMPLE_RATE).max(1) as usize;

    samples
        .chunks_exact(channels)
        .step_by(step)
        .map(|frame| {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            linear_to_mulaw((mono.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        })
        .collect()
}

/// Feeds encoded bytes into `track` in 20 ms samples until the sender side closes.
pub async fn pump_samples(
    track: Arc<TrackLocalStaticSample>,
    mut encoded: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut pending: Vec<u8> = Vec::with_capacity(FRAME_BYTES * 2);

    while let Some(chunk) = encoded.recv().await {
        pending.extend_from_slice(&chunk);

        while pending.len() >= FRAME_BYTES {
            let frame: Vec<u8> = pending.drain(..FRAME_BYTES).collect();
            let sample = Sample {
                data: Bytes::from(frame),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::warn!("Failed to write audio sample: {}", e);
            }
        }
    }

    tracing::debug!("Sample pump for track {} finished", track.id());
}
