use std::time::Duration;

use teapot_lib::audio::{AudioDeviceManager, VirtualBackend};
use teapot_lib::peer::{event_channel, Rendezvous, RtcProvider, Signal};
use teapot_lib::ui::{ui_channel, UiReceiver, UiState};
use teapot_lib::{Coordinator, CoordinatorHandle};
use tokio::task::JoinHandle;

struct Peer {
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
    ui: UiReceiver,
    state: UiState,
}

impl Peer {
    fn spawn(signals: &Rendezvous<Signal>) -> Self {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = ui_channel();
        // No ICE servers: host candidates only
        let provider = RtcProvider::new(signals.clone(), events_tx, Vec::new());
        let audio = AudioDeviceManager::new(VirtualBackend::new(), None);
        let (handle, task) = Coordinator::new(provider, audio, ui_tx).spawn(events);

        Self {
            handle,
            task,
            ui,
            state: UiState::new(),
        }
    }

    async fn wait_until(&mut self, what: &str, done: impl Fn(&UiState) -> bool) {
        let state = &mut self.state;
        let ui = &mut self.ui;
        tokio::time::timeout(Duration::from_secs(30), async {
            while !done(state) {
                let event = ui.recv().await.expect("coordinator alive");
                state.apply(event);
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinators_talk_over_webrtc() {
    let signals = Rendezvous::new();
    let mut host = Peer::spawn(&signals);
    let mut client = Peer::spawn(&signals);

    host.wait_until("host identity", |s| s.ready).await;
    client.wait_until("client identity", |s| s.ready).await;

    let host_id = host.state.identity.clone().unwrap();
    client.handle.connect(host_id.clone()).await.unwrap();

    client.wait_until("client connected", |s| s.connected).await;
    host.wait_until("host connected", |s| s.connected).await;
    assert!(host
        .state
        .log
        .text()
        .contains(&format!("ID: {} has Connected.", client.state.identity.clone().unwrap())));

    host.wait_until("audio at the host", |s| !s.playing.is_empty()).await;
    client.wait_until("audio at the client", |s| !s.playing.is_empty()).await;
    assert_eq!(host.state.playing[0].peer, client.state.identity.clone().unwrap());
    assert_eq!(client.state.playing[0].peer, host_id);

    client.handle.disconnect().unwrap();
    client.wait_until("client hung up", |s| !s.connected).await;

    host.handle.shutdown().unwrap();
    client.handle.shutdown().unwrap();
    host.task.await.unwrap();
    client.task.await.unwrap();
}
