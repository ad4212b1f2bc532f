//! The connection coordinator.
//!
//! Owns the [`Session`] and is the only thing that mutates it. Transport
//! events and user commands arrive one at a time, either by calling
//! [`Coordinator::handle`] directly or through the actor started by
//! [`Coordinator::spawn`].

use crate::audio::{AudioDeviceInfo, AudioDeviceManager};
use crate::error::{AudioError, Error, Result};
use crate::logger::SYSTEM_SENDER;
use crate::peer::types::{ACK_TOKEN, HELLO_TOKEN, NOT_CONNECTED_TOKEN};
use crate::peer::{
    DataLink, EventReceiver, LinkId, MediaLink, PeerEvent, PeerId, PeerProvider, RemoteStream,
};
use crate::session::{MediaState, Phase, Role, Session};
use crate::ui::{Notification, NotificationKind, UiEvent, UiSender, READY_COLOR};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const CONNECTED_TEXT: &str = "Successfully connected.";
pub const DISCONNECTED_TEXT: &str = "You have disconnected.";
pub const MEDIA_CLOSED_TEXT: &str = "Media closed.";
pub const TRANSPORT_ERROR_TEXT: &str = "Error connected peer ID.";
pub const SELF_CONNECT_TEXT: &str = "Can't connect your peer ID.";
pub const STREAMING_TEXT: &str = "Audio stream...";
pub const SWITCH_TEXT: &str = "Switch Audio Device.";
pub const SWITCH_FAILED_TEXT: &str = "Audio device switch failed.";

/// Why a session ends; picks the notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Requested,
    Rejected,
    ConnectionLost,
    MediaClosed,
    TransportFailure,
}

impl Teardown {
    fn notice(self) -> (&'static str, &'static str) {
        match self {
            Teardown::Requested | Teardown::Rejected | Teardown::ConnectionLost => {
                ("Disconnected", DISCONNECTED_TEXT)
            }
            Teardown::MediaClosed => ("Media Closed", MEDIA_CLOSED_TEXT),
            Teardown::TransportFailure => ("Error", TRANSPORT_ERROR_TEXT),
        }
    }
}

pub struct Coordinator<P> {
    provider: P,
    audio: AudioDeviceManager,
    session: Session,
    ui: UiSender,
}

impl<P: PeerProvider> Coordinator<P> {
    /// Takes the audio manager's startup capture as the local stream.
    pub fn new(provider: P, mut audio: AudioDeviceManager, ui: UiSender) -> Self {
        let mut session = Session::new();
        session.local_stream = audio.take_initial_stream();

        Self {
            provider,
            audio,
            session,
            ui,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Publishes the device list and asks the provider for an identity.
    pub fn start(&mut self) {
        match self.audio.input_devices() {
            Ok(devices) => self.emit(UiEvent::Devices(devices)),
            Err(e) => tracing::warn!("Could not list audio inputs: {}", e),
        }

        if let Err(e) = self.provider.start() {
            self.on_transport_error(&e.to_string());
        }
    }

    /// Single dispatch point for transport events.
    pub fn handle(&mut self, event: PeerEvent) {
        debug_assert!(
            self.session.invariants_hold(),
            "session invariants broken before {:?}",
            event
        );
        tracing::trace!(?event, "peer event");

        match event {
            PeerEvent::IdentityAssigned(id) => self.on_identity_assigned(id),
            PeerEvent::IncomingConnection(link) => self.on_incoming_connection(link),
            PeerEvent::ConnectionOpened(link) => self.on_connection_opened(link),
            PeerEvent::Data { link, payload } => self.on_data(link, &payload),
            PeerEvent::ConnectionClosed(link) => self.on_connection_closed(link),
            PeerEvent::IncomingCall(link) => self.on_incoming_call(link),
            PeerEvent::RemoteStream { link, stream } => self.on_remote_stream(link, stream),
            PeerEvent::CallClosed(link) => self.on_call_closed(link),
            PeerEvent::TransportError(err) => self.on_transport_error(&err),
        }
    }

    /// Dials `remote`. Connecting to ourselves is refused before the
    /// transport sees it; transport failures end in a teardown, not an `Err`.
    pub fn connect(&mut self, remote: &PeerId) -> Result<()> {
        let local = self.session.local_identity.clone().ok_or(Error::NotReady)?;

        if *remote == local {
            self.drop_dialing();
            self.emit(UiEvent::ClearInput);
            self.notify("Error", SELF_CONNECT_TEXT, NotificationKind::Error);
            self.log(SELF_CONNECT_TEXT);
            return Err(Error::SelfConnect(remote.to_string()));
        }

        if let Some(peer) = self.session.remote_peer() {
            return Err(Error::Busy(peer.to_string()));
        }

        if let Some(previous) = self.session.dialing.as_ref() {
            tracing::debug!("Dropping unopened link to {}", previous.peer());
        }
        self.drop_dialing();

        tracing::info!("Connect ID: {}", remote);
        match self.provider.connect(remote) {
            Ok(link) => self.session.dialing = Some(link),
            Err(e) => self.on_transport_error(&e.to_string()),
        }
        Ok(())
    }

    /// Ends the session. Safe to call when there is none.
    pub fn disconnect(&mut self) {
        self.teardown(Teardown::Requested);
    }

    /// Opens `device_id` and swaps it into the running call, if any.
    ///
    /// The new capture becomes the local stream even without a call. Failing
    /// to open the device leaves the old stream in place and is the only
    /// error returned; a failed track swap is reported to the UI.
    pub async fn switch_audio_device(&mut self, device_id: &str) -> Result<()> {
        let stream = self.audio.acquire(device_id)?;

        let replaced = match self.session.media_channel.clone() {
            Some(media) => media.replace_audio_track(&stream).await,
            None => Ok(false),
        };
        self.session.local_stream = Some(stream);

        match replaced {
            Ok(true) => {
                self.notify("Audio", SWITCH_TEXT, NotificationKind::Success);
                self.log(SWITCH_TEXT);
                Ok(())
            }
            Ok(false) => {
                tracing::debug!("No outbound audio to replace, stored {}", device_id);
                Ok(())
            }
            Err(e) => {
                let err = AudioError::ReplaceTrack(e.to_string());
                tracing::warn!("Switching to {}: {}", device_id, err);
                self.notify("Audio", SWITCH_FAILED_TEXT, NotificationKind::Error);
                self.log(SWITCH_FAILED_TEXT);
                Ok(())
            }
        }
    }

    pub fn input_devices(&self) -> Result<Vec<AudioDeviceInfo>> {
        Ok(self.audio.input_devices()?)
    }

    fn on_identity_assigned(&mut self, id: PeerId) {
        tracing::info!("Your peer ID: {}", id);
        self.session.local_identity = Some(id.clone());

        self.emit(UiEvent::Status {
            text: format!("ID: {}", id),
            color: READY_COLOR.to_string(),
        });
        self.emit(UiEvent::OwnIdentity(id.clone()));
        self.emit(UiEvent::Ready(true));
        self.log(&format!("Your peer ID: {}", id));
    }

    fn on_incoming_connection(&mut self, link: Arc<dyn DataLink>) {
        if self.session.role != Role::None {
            tracing::info!("Queueing {} from {} until the handshake", link.id(), link.peer());
            self.session.pending_rejects.push(link);
            return;
        }

        let peer = link.peer().clone();
        self.session.role = Role::Host;
        self.session.data_channel = Some(link);

        self.emit(UiEvent::Connected(true));
        self.notify("Success", CONNECTED_TEXT, NotificationKind::Success);
        self.log(&format!("ID: {} has Connected.", peer));

        self.place_call(&peer);
    }

    fn place_call(&mut self, peer: &PeerId) {
        let Some(stream) = self.session.local_stream.clone() else {
            tracing::info!("No local audio, session with {} stays data-only", peer);
            return;
        };

        match self.provider.call(peer, &stream) {
            Ok(media) => {
                self.session.media_channel = Some(media);
                self.session.media_state = MediaState::Offering;
            }
            Err(e) => self.on_transport_error(&e.to_string()),
        }
    }

    fn on_connection_opened(&mut self, id: LinkId) {
        if !self.session.is_dialing_link(id) {
            tracing::debug!("Open event for unknown {}", id);
            return;
        }
        let (Some(link), early_call) = self.session.take_dialing() else {
            return;
        };

        // Someone connected to us while we were dialing
        if self.session.role != Role::None {
            tracing::info!("Already hosting, refusing own link to {}", link.peer());
            let _ = link.send(NOT_CONNECTED_TOKEN);
            link.close();
            if let Some(call) = early_call {
                call.close();
            }
            return;
        }

        tracing::info!("You have connected to {}", link.peer());
        if let Err(e) = link.send(HELLO_TOKEN) {
            tracing::warn!("Hello to {} failed: {}", link.peer(), e);
        }
        self.session.role = Role::Client;
        self.session.data_channel = Some(link);

        self.emit(UiEvent::Connected(true));
        self.notify("Success", CONNECTED_TEXT, NotificationKind::Success);
        self.log("You have connected.");

        if let Some(call) = early_call {
            self.answer_call(call);
        }
    }

    fn on_data(&mut self, link: LinkId, payload: &str) {
        match payload {
            HELLO_TOKEN => self.on_hello(link),
            NOT_CONNECTED_TOKEN => {
                if self.session.is_active_link(link) || self.session.is_dialing_link(link) {
                    tracing::info!("Rejected on {}", link);
                    self.teardown(Teardown::Rejected);
                } else {
                    tracing::debug!("Ignoring rejection on stale {}", link);
                }
            }
            ACK_TOKEN => tracing::debug!("Host acknowledged on {}", link),
            other => tracing::debug!("Data on {}: {:?}", link, other),
        }
    }

    fn on_hello(&mut self, link: LinkId) {
        if self.session.role == Role::Host && self.session.is_active_link(link) {
            if let Some(active) = self.session.data_channel.as_ref() {
                if let Err(e) = active.send(ACK_TOKEN) {
                    tracing::warn!("Ack to {} failed: {}", active.peer(), e);
                }
            }
        }

        if self.session.role == Role::None {
            tracing::debug!("Hello on {} outside a session", link);
            return;
        }

        let rejected = self.session.drain_rejects();
        if !rejected.is_empty() {
            tracing::info!("Rejecting {} queued connection(s)", rejected.len());
        }
        for queued in rejected {
            if let Err(e) = queued.send(NOT_CONNECTED_TOKEN) {
                tracing::debug!("Rejection to {} not delivered: {}", queued.peer(), e);
            }
        }
    }

    fn on_connection_closed(&mut self, id: LinkId) {
        if self.session.is_active_link(id) {
            self.teardown(Teardown::ConnectionLost);
        } else if self.session.is_dialing_link(id) {
            tracing::info!("Outbound {} closed before opening", id);
            self.drop_dialing();
        } else if self.session.forget_queued(id) {
            tracing::debug!("Queued {} went away", id);
        }
    }

    fn on_incoming_call(&mut self, link: Arc<dyn MediaLink>) {
        // The host may call before our own link reports open
        let from_dialed = self.session.role == Role::None
            && self.session.early_call.is_none()
            && self.session.dialing.as_ref().is_some_and(|dial| dial.peer() == link.peer());
        if from_dialed {
            tracing::info!("Holding call {} from {} until our link opens", link.id(), link.peer());
            self.session.early_call = Some(link);
            return;
        }

        let expected = self.session.remote_peer() == Some(link.peer());
        if self.session.media_channel.is_some() || !expected {
            tracing::info!("Declining call {} from {}", link.id(), link.peer());
            link.close();
            return;
        }

        self.answer_call(link);
    }

    fn answer_call(&mut self, link: Arc<dyn MediaLink>) {
        if self.session.local_stream.is_none() {
            tracing::warn!("No local audio, answering {} receive-only", link.id());
        }
        match link.answer(self.session.local_stream.as_ref()) {
            Ok(()) => {
                self.session.media_channel = Some(link);
                self.session.media_state = MediaState::Answering;
            }
            Err(e) => {
                tracing::warn!("Answering {} failed: {}", link.id(), e);
                link.close();
            }
        }
    }

    fn on_remote_stream(&mut self, link: LinkId, stream: RemoteStream) {
        if !self.session.is_media_link(link) {
            tracing::debug!("Stream on inactive {}", link);
            return;
        }

        self.session.media_state = MediaState::Streaming;
        self.emit(UiEvent::PlayStream(stream));
        self.notify("Online", STREAMING_TEXT, NotificationKind::Info);
        self.log("Audio streaming...");
    }

    fn on_call_closed(&mut self, link: LinkId) {
        if self.session.is_media_link(link) {
            self.teardown(Teardown::MediaClosed);
        } else if self.session.is_early_call(link) {
            tracing::info!("Held call {} was withdrawn", link);
            self.session.early_call = None;
        }
    }

    fn on_transport_error(&mut self, err: &str) {
        tracing::warn!("Transport error: {}", err);
        self.teardown(Teardown::TransportFailure);
    }

    fn teardown(&mut self, reason: Teardown) {
        let (title, text) = reason.notice();
        tracing::debug!(?reason, "teardown");

        self.notify(title, text, NotificationKind::Error);
        self.log(text);

        let released = self.session.reset();
        self.emit(UiEvent::Connected(false));
        for link in released.data.into_iter().chain(released.dialing) {
            link.close();
        }
        for media in released.media.into_iter().chain(released.early_call) {
            media.close();
        }
        self.emit(UiEvent::ClearInput);
    }

    /// Closes the unopened outbound link and any call held behind it.
    fn drop_dialing(&mut self) {
        let (dial, early_call) = self.session.take_dialing();
        if let Some(link) = dial {
            link.close();
        }
        if let Some(call) = early_call {
            call.close();
        }
    }

    fn emit(&self, event: UiEvent) {
        // No subscriber is fine
        let _ = self.ui.send(event);
    }

    fn notify(&self, title: &str, text: &str, kind: NotificationKind) {
        self.emit(UiEvent::Notify(Notification {
            title: title.to_string(),
            text: text.to_string(),
            kind,
        }));
    }

    fn log(&self, text: &str) {
        self.emit(UiEvent::Log {
            sender: SYSTEM_SENDER.to_string(),
            text: text.to_string(),
        });
    }
}

/// Requests from the presentation layer
pub enum Command {
    Connect {
        remote: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    SwitchAudioDevice {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListDevices {
        reply: oneshot::Sender<Result<Vec<AudioDeviceInfo>>>,
    },
    Shutdown,
}

/// Cheap handle to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::CoordinatorGone)
    }

    pub async fn connect(&self, remote: PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { remote, reply })?;
        rx.await.map_err(|_| Error::CoordinatorGone)?
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    pub async fn switch_audio_device(&self, device_id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SwitchAudioDevice {
            device_id: device_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| Error::CoordinatorGone)?
    }

    pub async fn input_devices(&self) -> Result<Vec<AudioDeviceInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ListDevices { reply })?;
        rx.await.map_err(|_| Error::CoordinatorGone)?
    }

    /// Stops the actor; an active session is torn down first.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

impl<P: PeerProvider + 'static> Coordinator<P> {
    /// Runs the coordinator as an actor on the current tokio runtime.
    pub fn spawn(self, events: EventReceiver) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(events, rx));
        (CoordinatorHandle { commands: tx }, task)
    }

    async fn run(mut self, mut events: EventReceiver, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.start();

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command).await,
                },
            }
        }

        if self.session.phase() != Phase::Idle {
            self.disconnect();
        }
        tracing::debug!("Coordinator stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { remote, reply } => {
                let _ = reply.send(self.connect(&remote));
            }
            Command::Disconnect => self.disconnect(),
            Command::SwitchAudioDevice { device_id, reply } => {
                let _ = reply.send(self.switch_audio_device(&device_id).await);
            }
            Command::ListDevices { reply } => {
                let _ = reply.send(self.input_devices());
            }
            Command::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VirtualBackend;
    use crate::peer::{event_channel, LoopbackProvider, Rendezvous};
    use crate::ui::{ui_channel, UiReceiver};

    fn coordinator(
        rendezvous: &Rendezvous<PeerEvent>,
    ) -> (Coordinator<LoopbackProvider>, EventReceiver, UiReceiver) {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = ui_channel();
        let audio = AudioDeviceManager::new(VirtualBackend::new(), None);
        let provider = LoopbackProvider::new(rendezvous.clone(), events_tx);
        (Coordinator::new(provider, audio, ui_tx), events, ui)
    }

    fn pump(coordinator: &mut Coordinator<LoopbackProvider>, events: &mut EventReceiver) {
        while let Ok(event) = events.try_recv() {
            coordinator.handle(event);
        }
    }

    #[test]
    fn identity_marks_ui_ready() {
        let rendezvous = Rendezvous::new();
        let (mut c, mut events, mut ui) = coordinator(&rendezvous);
        c.start();
        pump(&mut c, &mut events);

        let id = c.session().local_identity().cloned().unwrap();
        let mut seen = Vec::new();
        while let Ok(event) = ui.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&UiEvent::Ready(true)));
        assert!(seen.contains(&UiEvent::Status {
            text: format!("ID: {}", id),
            color: READY_COLOR.to_string()
        }));
    }

    #[test]
    fn connect_before_identity_is_refused() {
        let rendezvous = Rendezvous::new();
        let (mut c, _events, _ui) = coordinator(&rendezvous);
        assert!(matches!(c.connect(&PeerId::from("x")), Err(Error::NotReady)));
    }

    #[test]
    fn transport_error_tears_down() {
        let rendezvous = Rendezvous::new();
        let (mut c, mut events, mut ui) = coordinator(&rendezvous);
        c.start();
        pump(&mut c, &mut events);
        while ui.try_recv().is_ok() {}

        c.handle(PeerEvent::TransportError("signaling lost".into()));
        assert_eq!(c.session().phase(), Phase::Idle);
        assert_eq!(
            ui.try_recv().unwrap(),
            UiEvent::Notify(Notification {
                title: "Error".into(),
                text: TRANSPORT_ERROR_TEXT.into(),
                kind: NotificationKind::Error,
            })
        );
    }

    #[test]
    fn unknown_peer_ends_in_transport_teardown() {
        let rendezvous = Rendezvous::new();
        let (mut c, mut events, _ui) = coordinator(&rendezvous);
        c.start();
        pump(&mut c, &mut events);

        assert!(c.connect(&PeerId::from("nobody")).is_ok());
        assert!(!c.session().is_dialing());
        assert_eq!(c.session().role(), Role::None);
    }
}
