//! What the coordinator tells the presentation layer.

use crate::audio::AudioDeviceInfo;
use crate::logger::LogBook;
use crate::peer::{PeerId, RemoteStream};
use tokio::sync::mpsc;

/// Status colour once the identity is known
pub const READY_COLOR: &str = "rgb(0, 255, 0)";

/// Status colour before the identity arrives
pub const STARTING_COLOR: &str = "rgb(255, 0, 0)";

pub const STARTING_STATUS: &str = "Peer starting...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Info,
    Error,
}

/// A toast: title, body and severity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub text: String,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Ready(bool),
    Status { text: String, color: String },
    OwnIdentity(PeerId),
    Connected(bool),
    Log { sender: String, text: String },
    Notify(Notification),
    /// Empty the bound input field, if one is bound
    ClearInput,
    PlayStream(RemoteStream),
    Devices(Vec<AudioDeviceInfo>),
}

pub type UiSender = mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = mpsc::UnboundedReceiver<UiEvent>;

pub fn ui_channel() -> (UiSender, UiReceiver) {
    mpsc::unbounded_channel()
}

/// The presentation layer's view, rebuilt from the event stream.
#[derive(Debug, Clone)]
pub struct UiState {
    pub ready: bool,
    pub status: String,
    pub status_color: String,
    pub identity: Option<PeerId>,
    pub connected: bool,
    pub log: LogBook,
    /// `None` until a field is bound
    pub input: Option<String>,
    pub notifications: Vec<Notification>,
    pub playing: Vec<RemoteStream>,
    pub devices: Vec<AudioDeviceInfo>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            ready: false,
            status: STARTING_STATUS.to_string(),
            status_color: STARTING_COLOR.to_string(),
            identity: None,
            connected: false,
            log: LogBook::new(),
            input: None,
            notifications: Vec::new(),
            playing: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl UiState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the input field the core may clear.
    pub fn bind_input(&mut self, text: impl Into<String>) {
        self.input = Some(text.into());
    }

    pub fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Ready(ready) => self.ready = ready,
            UiEvent::Status { text, color } => {
                self.status = text;
                self.status_color = color;
            }
            UiEvent::OwnIdentity(id) => self.identity = Some(id),
            UiEvent::Connected(connected) => self.connected = connected,
            UiEvent::Log { sender, text } => self.log.append(&sender, &text),
            UiEvent::Notify(notification) => self.notifications.push(notification),
            UiEvent::ClearInput => {
                if let Some(input) = self.input.as_mut() {
                    input.clear();
                }
            }
            UiEvent::PlayStream(stream) => self.playing.push(stream),
            UiEvent::Devices(devices) => self.devices = devices,
        }
    }

    /// Applies everything already queued, returns how many events that was.
    pub fn drain(&mut self, rx: &mut UiReceiver) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }
}
