pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod ui;
pub mod utils;

use anyhow::{bail, Context};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audio::{AudioDeviceManager, VirtualBackend};
use crate::config::{AudioBackendKind, AudioConfig, Config, TransportKind};
use crate::peer::{event_channel, LoopbackProvider, PeerEvent, PeerProvider, Rendezvous, RtcProvider, Signal};
use crate::ui::{ui_channel, UiReceiver, UiState};

pub use crate::coordinator::{Coordinator, CoordinatorHandle};
pub use crate::error::{Error, Result};
pub use crate::session::{MediaState, Phase, Role, Session};

/// Environment variable naming a TOML config file for [`run`]
pub const CONFIG_ENV: &str = "TEAPOT_CONFIG";

const DEMO_TIMEOUT: Duration = Duration::from_secs(20);

/// Where peers of one process find each other
enum Broker {
    Loopback(Rendezvous<PeerEvent>),
    Webrtc(Rendezvous<Signal>),
}

fn audio_manager(config: &AudioConfig) -> AudioDeviceManager {
    let device = config.device_id.as_deref();
    match config.backend {
        AudioBackendKind::Virtual => AudioDeviceManager::new(VirtualBackend::new(), device),
        #[cfg(feature = "cpal")]
        AudioBackendKind::Cpal => AudioDeviceManager::new(crate::audio::CpalBackend::new(), device),
        #[cfg(not(feature = "cpal"))]
        AudioBackendKind::Cpal => {
            tracing::warn!("Built without the cpal feature, using virtual audio");
            AudioDeviceManager::new(VirtualBackend::new(), device)
        }
    }
}

/// One coordinator plus the presentation state it drives
struct DemoPeer {
    name: &'static str,
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
    ui: UiReceiver,
    state: UiState,
}

impl DemoPeer {
    fn spawn(name: &'static str, config: &Config, broker: &Broker) -> Self {
        let (events_tx, events) = event_channel();
        let (ui_tx, ui) = ui_channel();

        let provider: Box<dyn PeerProvider> = match broker {
            Broker::Loopback(rendezvous) => Box::new(LoopbackProvider::new(rendezvous.clone(), events_tx)),
            Broker::Webrtc(signals) => Box::new(RtcProvider::new(
                signals.clone(),
                events_tx,
                config.ice_servers_or_default(),
            )),
        };

        let coordinator = Coordinator::new(provider, audio_manager(&config.audio), ui_tx);
        let (handle, task) = coordinator.spawn(events);

        let mut state = UiState::new();
        state.bind_input("");
        Self {
            name,
            handle,
            task,
            ui,
            state,
        }
    }

    /// Applies UI events until `done` holds.
    async fn wait_until(&mut self, what: &str, done: impl Fn(&UiState) -> bool) -> anyhow::Result<()> {
        let state = &mut self.state;
        let ui = &mut self.ui;
        let waited = tokio::time::timeout(DEMO_TIMEOUT, async {
            while !done(state) {
                match ui.recv().await {
                    Some(event) => state.apply(event),
                    None => break,
                }
            }
        })
        .await;

        if waited.is_err() {
            bail!("{}: timed out waiting for {}", self.name, what);
        }
        if !done(&self.state) {
            bail!("{}: coordinator stopped before {}", self.name, what);
        }
        Ok(())
    }

    fn print(&mut self) {
        self.state.drain(&mut self.ui);
        println!(
            "== {} | {} | {} | connected={} | playing={}",
            self.name,
            self.state.status,
            self.state.status_color,
            self.state.connected,
            self.state.playing.len()
        );
        println!("{}", self.state.log.text());
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.handle.shutdown()?;
        self.task.await?;
        Ok(())
    }
}

/// Loads the config named by `TEAPOT_CONFIG` (defaults otherwise) and runs the demo.
pub fn run() -> anyhow::Result<()> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("loading {}", path.to_string_lossy()))?,
        None => Config::default(),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_with(config))
}

/// Two coordinators in one process: bob connects to alice, both print what
/// their UI would show, then bob hangs up.
pub async fn run_with(config: Config) -> anyhow::Result<()> {
    logger::init_tracing(&config.logging);
    tracing::info!("Starting with {:?} transport", config.transport);

    let broker = match config.transport {
        TransportKind::Loopback => Broker::Loopback(Rendezvous::new()),
        TransportKind::Webrtc => Broker::Webrtc(Rendezvous::new()),
    };

    let mut alice = DemoPeer::spawn("alice", &config, &broker);
    let mut bob = DemoPeer::spawn("bob", &config, &broker);

    alice.wait_until("identity", |s| s.ready).await?;
    bob.wait_until("identity", |s| s.ready).await?;

    let alice_id = alice.state.identity.clone().context("alice has no identity")?;
    bob.state.bind_input(alice_id.to_string());
    bob.handle.connect(alice_id).await?;

    bob.wait_until("connection", |s| s.connected).await?;
    alice.wait_until("connection", |s| s.connected).await?;
    if let Err(e) = bob.wait_until("audio", |s| !s.playing.is_empty()).await {
        tracing::warn!("{}", e);
    }

    alice.print();
    bob.print();

    bob.handle.disconnect()?;
    alice.wait_until("disconnect", |s| !s.connected).await?;

    alice.print();
    bob.print();

    alice.stop().await?;
    bob.stop().await?;
    Ok(())
}
