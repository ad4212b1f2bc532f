use std::sync::Arc;
use std::time::Duration;

use teapot_lib::audio::{AudioDeviceManager, VirtualBackend};
use teapot_lib::coordinator::{
    CONNECTED_TEXT, DISCONNECTED_TEXT, MEDIA_CLOSED_TEXT, SELF_CONNECT_TEXT, SWITCH_FAILED_TEXT,
    SWITCH_TEXT,
};
use teapot_lib::error::{AudioError, Error};
use teapot_lib::peer::types::{HELLO_TOKEN, NOT_CONNECTED_TOKEN};
use teapot_lib::peer::{
    event_channel, DataLink, EventReceiver, LoopbackProvider, PeerEvent, PeerId, PeerProvider,
    Rendezvous,
};
use teapot_lib::ui::{ui_channel, NotificationKind, UiEvent, UiReceiver, UiState};
use teapot_lib::{Coordinator, MediaState, Phase, Role};

struct Node {
    coordinator: Coordinator<LoopbackProvider>,
    events: EventReceiver,
    ui: UiReceiver,
    state: UiState,
    backend: VirtualBackend,
}

impl Node {
    fn new(rendezvous: &Rendezvous<PeerEvent>) -> Self {
        Self::with_backend(rendezvous, VirtualBackend::new())
    }

    /// A node whose microphone permission is refused
    fn without_audio(rendezvous: &Rendezvous<PeerEvent>) -> Self {
        let backend = VirtualBackend::new();
        backend.set_denied(true);
        Self::with_backend(rendezvous, backend)
    }

    fn with_backend(rendezvous: &Rendezvous<PeerEvent>, backend: VirtualBackend) -> Self {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = ui_channel();
        let provider = LoopbackProvider::new(rendezvous.clone(), events_tx);
        let audio = AudioDeviceManager::new(backend.clone(), None);

        let mut node = Self {
            coordinator: Coordinator::new(provider, audio, ui_tx),
            events,
            ui,
            state: UiState::new(),
            backend,
        };
        node.state.bind_input("");
        node.coordinator.start();
        node.pump();
        node
    }

    fn id(&self) -> PeerId {
        self.coordinator
            .session()
            .local_identity()
            .cloned()
            .expect("identity assigned on start")
    }

    /// Handles every queued event; true when there was at least one.
    fn pump(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.events.try_recv() {
            self.coordinator.handle(event);
            any = true;
        }
        self.state.drain(&mut self.ui);
        any
    }

    fn connect(&mut self, remote: &PeerId) {
        self.state.bind_input(remote.to_string());
        self.coordinator.connect(remote).expect("connect accepted");
    }

    fn notifications_with(&self, text: &str) -> usize {
        self.state
            .notifications
            .iter()
            .filter(|n| n.text == text)
            .count()
    }
}

/// Pumps the nodes in order until every queue is quiet.
fn settle(nodes: &mut [&mut Node]) {
    loop {
        let mut any = false;
        for node in nodes.iter_mut() {
            any |= node.pump();
        }
        if !any {
            break;
        }
    }
}

/// A bare provider standing in for a remote peer we script by hand
fn raw_peer(rendezvous: &Rendezvous<PeerEvent>) -> (LoopbackProvider, EventReceiver, PeerId) {
    let (tx, mut rx) = event_channel();
    let mut provider = LoopbackProvider::new(rendezvous.clone(), tx);
    provider.start().unwrap();
    match rx.try_recv().unwrap() {
        PeerEvent::IdentityAssigned(id) => (provider, rx, id),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn client_connects_and_audio_flows_both_ways() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);

    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    assert_eq!(host.coordinator.session().role(), Role::Host);
    assert_eq!(client.coordinator.session().role(), Role::Client);
    assert_eq!(host.coordinator.session().remote_peer(), Some(&client.id()));
    assert!(host.state.connected && client.state.connected);

    assert_eq!(host.coordinator.session().media_state(), MediaState::Streaming);
    assert_eq!(client.coordinator.session().media_state(), MediaState::Streaming);
    assert_eq!(host.state.playing.len(), 1);
    assert_eq!(client.state.playing.len(), 1);

    assert_eq!(host.notifications_with(CONNECTED_TEXT), 1);
    assert!(host
        .state
        .log
        .text()
        .contains(&format!("[System] ID: {} has Connected.", client.id())));
    assert!(client.state.log.text().contains("[System] You have connected."));
    assert!(client.state.log.text().contains("[System] Audio streaming..."));
}

#[test]
fn call_before_open_is_held_then_answered() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);

    client.connect(&host.id());
    host.pump();
    assert_eq!(host.coordinator.session().media_state(), MediaState::Offering);

    let mut queued = Vec::new();
    while let Ok(event) = client.events.try_recv() {
        queued.push(event);
    }
    assert!(matches!(
        queued.as_slice(),
        [PeerEvent::ConnectionOpened(_), PeerEvent::IncomingCall(_)]
    ));

    // The call overtakes our own open event
    let opened = queued.remove(0);
    let call = queued.remove(0);
    client.coordinator.handle(call);
    assert!(client.coordinator.session().has_early_call());
    assert!(!client.coordinator.session().has_media_channel());
    assert!(client.coordinator.session().invariants_hold());

    client.coordinator.handle(opened);
    assert!(!client.coordinator.session().has_early_call());
    settle(&mut [&mut host, &mut client]);

    assert_eq!(host.coordinator.session().role(), Role::Host);
    assert_eq!(client.coordinator.session().role(), Role::Client);
    assert_eq!(host.coordinator.session().media_state(), MediaState::Streaming);
    assert_eq!(client.coordinator.session().media_state(), MediaState::Streaming);
    assert_eq!(host.state.playing.len(), 1);
    assert_eq!(client.state.playing.len(), 1);
}

#[test]
fn held_call_closes_with_an_abandoned_dial() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);

    client.connect(&host.id());
    host.pump();
    let call = loop {
        match client.events.try_recv().unwrap() {
            PeerEvent::IncomingCall(call) => break call,
            _ => continue,
        }
    };
    client.coordinator.handle(PeerEvent::IncomingCall(call));
    assert!(client.coordinator.session().has_early_call());

    client.coordinator.disconnect();
    settle(&mut [&mut host, &mut client]);

    assert!(!client.coordinator.session().has_early_call());
    assert_eq!(client.coordinator.session().phase(), Phase::Idle);
    assert_eq!(host.coordinator.session().phase(), Phase::Idle);
    assert_eq!(host.coordinator.session().media_state(), MediaState::Closed);
}

#[test]
fn only_one_session_under_inbound_burst() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut first = Node::new(&rendezvous);
    let mut others: Vec<Node> = (0..4).map(|_| Node::new(&rendezvous)).collect();

    first.connect(&host.id());
    for node in others.iter_mut() {
        node.connect(&host.id());
    }

    host.pump();
    assert_eq!(host.coordinator.session().remote_peer(), Some(&first.id()));
    assert_eq!(host.coordinator.session().pending_rejects(), 4);
    assert!(host.coordinator.session().invariants_hold());

    let mut all: Vec<&mut Node> = vec![&mut host, &mut first];
    all.extend(others.iter_mut());
    settle(&mut all);

    assert_eq!(host.coordinator.session().remote_peer(), Some(&first.id()));
    assert_eq!(host.coordinator.session().pending_rejects(), 0);
    assert_eq!(first.coordinator.session().phase(), Phase::ClientActive);
    for node in &others {
        let session = node.coordinator.session();
        assert_eq!(session.role(), Role::None);
        assert!(!session.has_data_channel());
        assert!(!session.has_media_channel());
        assert_eq!(node.notifications_with(DISCONNECTED_TEXT), 1);
    }
}

#[test]
fn race_winner_keeps_the_host() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut a = Node::new(&rendezvous);
    let mut b = Node::new(&rendezvous);

    a.connect(&host.id());
    b.connect(&host.id());
    settle(&mut [&mut host, &mut a, &mut b]);

    assert_eq!(host.coordinator.session().role(), Role::Host);
    assert_eq!(host.coordinator.session().remote_peer(), Some(&a.id()));
    assert_eq!(a.coordinator.session().role(), Role::Client);
    assert_eq!(b.coordinator.session().role(), Role::None);
    assert!(!b.state.connected);
    assert!(b.state.log.text().contains("[System] You have disconnected."));
}

#[test]
fn handshake_drains_every_queued_connector() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut winner, _winner_rx, _) = raw_peer(&rendezvous);
    let mut losers: Vec<_> = (0..3).map(|_| raw_peer(&rendezvous)).collect();

    let link = winner.connect(&host.id()).unwrap();
    let loser_links: Vec<Arc<dyn DataLink>> = losers
        .iter_mut()
        .map(|(provider, _, _)| provider.connect(&host.id()).unwrap())
        .collect();
    host.pump();
    assert_eq!(host.coordinator.session().pending_rejects(), 3);

    link.send(HELLO_TOKEN).unwrap();
    host.pump();
    assert_eq!(host.coordinator.session().pending_rejects(), 0);

    for ((_, rx, _), sent) in losers.iter_mut().zip(&loser_links) {
        let mut rejected = false;
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::Data { link, payload } = event {
                assert_eq!(link, sent.id());
                rejected |= payload == NOT_CONNECTED_TOKEN;
            }
        }
        assert!(rejected);
    }
}

#[test]
fn host_acks_only_the_active_link() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut winner, mut winner_rx, _) = raw_peer(&rendezvous);
    let (mut loser, mut loser_rx, _) = raw_peer(&rendezvous);

    let active = winner.connect(&host.id()).unwrap();
    let queued = loser.connect(&host.id()).unwrap();
    host.pump();

    queued.send(HELLO_TOKEN).unwrap();
    active.send(HELLO_TOKEN).unwrap();
    host.pump();

    let payloads = |rx: &mut EventReceiver| {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PeerEvent::Data { payload, .. } = event {
                seen.push(payload);
            }
        }
        seen
    };
    assert_eq!(payloads(&mut winner_rx), vec!["OK.".to_string()]);
    assert_eq!(payloads(&mut loser_rx), vec![NOT_CONNECTED_TOKEN.to_string()]);
}

#[test]
fn client_rejects_connectors_queued_behind_it() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);
    let mut late = Node::new(&rendezvous);

    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);
    assert_eq!(client.coordinator.session().phase(), Phase::ClientActive);

    late.connect(&client.id());
    client.pump();
    assert_eq!(client.coordinator.session().pending_rejects(), 1);

    settle(&mut [&mut host, &mut client, &mut late]);

    let late_session = late.coordinator.session();
    assert_eq!(late_session.role(), Role::None);
    assert!(!late_session.has_data_channel());
    assert_eq!(late.notifications_with(DISCONNECTED_TEXT), 1);

    let client_session = client.coordinator.session();
    assert_eq!(client_session.phase(), Phase::ClientActive);
    assert_eq!(client_session.pending_rejects(), 0);
    assert_eq!(client_session.remote_peer(), Some(&host.id()));
    assert_eq!(host.coordinator.session().remote_peer(), Some(&client.id()));
}

#[test]
fn rejection_tears_down() {
    let rendezvous = Rendezvous::new();
    let mut client = Node::new(&rendezvous);
    let (_host, mut host_rx, host_id) = raw_peer(&rendezvous);

    client.connect(&host_id);
    client.pump();
    assert_eq!(client.coordinator.session().role(), Role::Client);

    let far = match host_rx.try_recv().unwrap() {
        PeerEvent::IncomingConnection(link) => link,
        other => panic!("unexpected {:?}", other),
    };
    far.send(NOT_CONNECTED_TOKEN).unwrap();
    client.pump();

    let session = client.coordinator.session();
    assert_eq!(session.role(), Role::None);
    assert!(!session.has_data_channel());
    assert!(!session.has_media_channel());
    assert_eq!(client.state.input.as_deref(), Some(""));
}

#[test]
fn self_connect_is_refused_without_a_link() {
    let rendezvous = Rendezvous::new();
    let mut node = Node::new(&rendezvous);
    let own = node.id();

    node.state.bind_input(own.to_string());
    let result = node.coordinator.connect(&own);
    assert!(matches!(result, Err(Error::SelfConnect(_))));
    assert!(!node.pump_events_only());
    node.pump();

    let session = node.coordinator.session();
    assert_eq!(session.role(), Role::None);
    assert!(!session.is_dialing());
    assert_eq!(node.state.input.as_deref(), Some(""));

    let errors: Vec<_> = node
        .state
        .notifications
        .iter()
        .filter(|n| n.kind == NotificationKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].text, SELF_CONNECT_TEXT);
    assert_eq!(errors[0].title, "Error");
}

impl Node {
    /// Pumps transport events without touching the UI state.
    fn pump_events_only(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.events.try_recv() {
            self.coordinator.handle(event);
            any = true;
        }
        any
    }
}

#[test]
fn self_connect_keeps_an_active_session() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);
    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    let own = host.id();
    assert!(host.coordinator.connect(&own).is_err());
    settle(&mut [&mut host, &mut client]);
    assert_eq!(host.coordinator.session().role(), Role::Host);
    assert_eq!(client.coordinator.session().role(), Role::Client);
}

#[test]
fn second_connect_during_session_is_busy() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);
    let other = Node::new(&rendezvous);
    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    assert!(matches!(
        client.coordinator.connect(&other.id()),
        Err(Error::Busy(_))
    ));
    assert_eq!(client.coordinator.session().remote_peer(), Some(&host.id()));
}

#[test]
fn double_disconnect_equals_single() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);
    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    client.coordinator.disconnect();
    settle(&mut [&mut host, &mut client]);
    let once = (
        client.coordinator.session().phase(),
        client.coordinator.session().has_data_channel(),
        client.coordinator.session().has_media_channel(),
        client.state.connected,
    );

    client.coordinator.disconnect();
    settle(&mut [&mut host, &mut client]);
    let twice = (
        client.coordinator.session().phase(),
        client.coordinator.session().has_data_channel(),
        client.coordinator.session().has_media_channel(),
        client.state.connected,
    );

    assert_eq!(once, (Phase::Idle, false, false, false));
    assert_eq!(once, twice);
    assert_eq!(host.coordinator.session().phase(), Phase::Idle);
}

#[test]
fn lost_media_ends_the_session() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut client, mut client_rx, _) = raw_peer(&rendezvous);

    let _link = client.connect(&host.id()).unwrap();
    host.pump();
    assert_eq!(host.coordinator.session().media_state(), MediaState::Offering);

    let call = loop {
        match client_rx.try_recv().unwrap() {
            PeerEvent::IncomingCall(call) => break call,
            _ => continue,
        }
    };
    call.close();
    host.pump();

    assert_eq!(host.coordinator.session().phase(), Phase::Idle);
    assert_eq!(host.coordinator.session().media_state(), MediaState::Closed);
    let closed = host
        .state
        .notifications
        .iter()
        .find(|n| n.text == MEDIA_CLOSED_TEXT)
        .expect("media closed notification");
    assert_eq!(closed.title, "Media Closed");
}

#[test]
fn host_without_audio_stays_data_only() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::without_audio(&rendezvous);
    let mut client = Node::new(&rendezvous);

    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    assert_eq!(host.coordinator.session().role(), Role::Host);
    assert!(!host.coordinator.session().has_media_channel());
    assert_eq!(client.coordinator.session().role(), Role::Client);
    assert!(host.state.playing.is_empty());
}

#[test]
fn client_without_audio_answers_receive_only() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::without_audio(&rendezvous);

    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    assert_eq!(client.coordinator.session().media_state(), MediaState::Streaming);
    assert_eq!(client.state.playing.len(), 1);
    assert_eq!(host.coordinator.session().media_state(), MediaState::Offering);
    assert!(host.state.playing.is_empty());
}

#[test]
fn queued_link_closing_leaves_the_queue() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut winner, _winner_rx, _) = raw_peer(&rendezvous);
    let (mut loser, _loser_rx, _) = raw_peer(&rendezvous);

    let _active = winner.connect(&host.id()).unwrap();
    let queued = loser.connect(&host.id()).unwrap();
    host.pump();
    assert_eq!(host.coordinator.session().pending_rejects(), 1);

    queued.close();
    host.pump();
    assert_eq!(host.coordinator.session().pending_rejects(), 0);
    assert_eq!(host.coordinator.session().role(), Role::Host);
}

#[test]
fn teardown_keeps_queued_links() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut winner, _winner_rx, _) = raw_peer(&rendezvous);
    let (mut loser, _loser_rx, _) = raw_peer(&rendezvous);

    let _active = winner.connect(&host.id()).unwrap();
    let _queued = loser.connect(&host.id()).unwrap();
    host.pump();

    host.coordinator.disconnect();
    host.pump();
    assert_eq!(host.coordinator.session().phase(), Phase::Idle);
    assert_eq!(host.coordinator.session().pending_rejects(), 1);
}

#[tokio::test]
async fn switch_without_call_only_stores_stream() {
    let rendezvous = Rendezvous::new();
    let mut node = Node::new(&rendezvous);

    node.coordinator
        .switch_audio_device("virtual:line-in")
        .await
        .unwrap();
    node.pump();

    let stream = node.coordinator.session().local_stream().unwrap();
    assert_eq!(stream.device_id(), "virtual:line-in");
    assert_eq!(node.notifications_with(SWITCH_TEXT), 0);
}

#[tokio::test]
async fn switch_during_call_replaces_track() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let mut client = Node::new(&rendezvous);
    client.connect(&host.id());
    settle(&mut [&mut host, &mut client]);

    host.coordinator
        .switch_audio_device("virtual:line-in")
        .await
        .unwrap();
    host.pump();

    assert_eq!(host.notifications_with(SWITCH_TEXT), 1);
    let switched = host.state.notifications.last().unwrap();
    assert_eq!(switched.title, "Audio");
    assert_eq!(host.coordinator.session().phase(), Phase::HostActive);
}

#[tokio::test]
async fn failed_track_swap_is_reported_not_returned() {
    let rendezvous = Rendezvous::new();
    let mut host = Node::new(&rendezvous);
    let (mut client, mut client_rx, _) = raw_peer(&rendezvous);

    let _link = client.connect(&host.id()).unwrap();
    host.pump();
    let call = loop {
        match client_rx.try_recv().unwrap() {
            PeerEvent::IncomingCall(call) => break call,
            _ => continue,
        }
    };

    // Host has not seen the close yet
    call.close();
    host.coordinator
        .switch_audio_device("virtual:line-in")
        .await
        .unwrap();
    assert_eq!(
        host.coordinator.session().local_stream().unwrap().device_id(),
        "virtual:line-in"
    );

    host.pump();
    assert_eq!(host.notifications_with(SWITCH_FAILED_TEXT), 1);
    assert_eq!(host.notifications_with(SWITCH_TEXT), 0);
    assert_eq!(host.coordinator.session().phase(), Phase::Idle);
}

#[tokio::test]
async fn failed_switch_keeps_old_stream() {
    let rendezvous = Rendezvous::new();
    let mut node = Node::new(&rendezvous);

    let result = node.coordinator.switch_audio_device("virtual:nowhere").await;
    assert!(matches!(
        result,
        Err(Error::Audio(AudioError::DeviceNotFound(_)))
    ));
    assert_eq!(
        node.coordinator.session().local_stream().unwrap().device_id(),
        "virtual:mic"
    );

    node.backend.set_denied(true);
    assert!(node
        .coordinator
        .switch_audio_device("virtual:line-in")
        .await
        .is_err());
    assert_eq!(
        node.coordinator.session().local_stream().unwrap().device_id(),
        "virtual:mic"
    );
}

async fn wait_for(state: &mut UiState, ui: &mut UiReceiver, done: impl Fn(&UiState) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(state) {
            let event: UiEvent = ui.recv().await.expect("coordinator alive");
            state.apply(event);
        }
    })
    .await
    .expect("ui reached expected state");
}

#[tokio::test]
async fn actors_connect_and_hang_up() {
    let rendezvous = Rendezvous::new();
    let spawn = |rendezvous: &Rendezvous<PeerEvent>| {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = ui_channel();
        let provider = LoopbackProvider::new(rendezvous.clone(), events_tx);
        let audio = AudioDeviceManager::new(VirtualBackend::new(), None);
        let (handle, task) = Coordinator::new(provider, audio, ui_tx).spawn(events);
        (handle, task, ui, UiState::new())
    };

    let (host, host_task, mut host_ui, mut host_state) = spawn(&rendezvous);
    let (client, client_task, mut client_ui, mut client_state) = spawn(&rendezvous);

    wait_for(&mut host_state, &mut host_ui, |s| s.ready).await;
    wait_for(&mut client_state, &mut client_ui, |s| s.ready).await;
    assert_eq!(host.input_devices().await.unwrap().len(), 2);

    assert!(matches!(
        client.connect(client_state.identity.clone().unwrap()).await,
        Err(Error::SelfConnect(_))
    ));
    let host_id = host_state.identity.clone().unwrap();
    client.connect(host_id).await.unwrap();

    wait_for(&mut client_state, &mut client_ui, |s| !s.playing.is_empty()).await;
    wait_for(&mut host_state, &mut host_ui, |s| !s.playing.is_empty()).await;
    assert!(host_state.connected && client_state.connected);

    client.switch_audio_device("virtual:line-in").await.unwrap();
    client.disconnect().unwrap();
    wait_for(&mut host_state, &mut host_ui, |s| !s.connected).await;
    wait_for(&mut client_state, &mut client_ui, |s| !s.connected).await;

    host.shutdown().unwrap();
    client.shutdown().unwrap();
    host_task.await.unwrap();
    client_task.await.unwrap();
    assert!(matches!(host.disconnect(), Err(Error::CoordinatorGone)));
}
