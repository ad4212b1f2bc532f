//! Error types for the voice chat core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Can't connect your peer ID: {0}")]
    SelfConnect(String),

    #[error("Already in a session with {0}")]
    Busy(String),

    #[error("Peer identity not assigned yet")]
    NotReady,

    #[error("Coordinator is no longer running")]
    CoordinatorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied for device: {0}")]
    PermissionDenied(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Track replacement failed: {0}")]
    ReplaceTrack(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Peer transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Channel is closed")]
    Closed,

    #[error("Channel is not open yet")]
    NotOpen,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Signaling bundle encoding errors
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Bundle exceeds {0} bytes after decompression")]
    TooLarge(u64),
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Transport(TransportError::WebRtc(e))
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
