//! webrtc-rs transport.
//!
//! Every data link and every call is its own `RTCPeerConnection`. Offers and
//! answers travel as encoded [`SignalBundle`]s through an in-process
//! [`Rendezvous`]; non-trickle, each bundle carries the gathered candidates.
//! A callee that drops an offer unanswered sends a hangup instead, so the
//! caller's link closes as it would on the loopback transport.

use crate::audio::LocalStream;
use crate::error::{Result, TransportError};
use crate::peer::codec;
use crate::peer::connection::{answer_bundle, new_peer, offer_bundle};
use crate::peer::data_channel::{attach_dc, RtcDataLink, Side, DATA_CHANNEL_LABEL};
use crate::peer::media::{AnswerRoute, RtcMediaLink};
use crate::peer::rendezvous::Rendezvous;
use crate::peer::transport::{DataLink, EventSender, MediaLink, PeerEvent, PeerProvider};
use crate::peer::types::{ChannelKind, PeerId, ServerConfig, SignalBundle};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

/// What one provider posts to another through the rendezvous
#[derive(Debug, Clone)]
pub enum Signal {
    /// Encoded offer or answer
    Bundle { from: PeerId, bundle: String },
    /// The callee dropped the offer `negotiation` without answering
    Hangup { from: PeerId, negotiation: String },
}

/// An offer we sent and its link, until answered or hung up
struct PendingOffer {
    remote: PeerId,
    pc: Arc<RTCPeerConnection>,
    hangup: Box<dyn Fn() + Send + Sync>,
}

/// Offers by negotiation id
type PendingOffers = Arc<Mutex<HashMap<String, PendingOffer>>>;

#[derive(Clone)]
struct RtcContext {
    local: PeerId,
    signals: Rendezvous<Signal>,
    events: EventSender,
    ice_servers: Arc<Vec<ServerConfig>>,
    pending: PendingOffers,
}

impl RtcContext {
    fn report(&self, what: &str, err: impl std::fmt::Display) {
        tracing::warn!("{} failed: {}", what, err);
        let _ = self
            .events
            .send(PeerEvent::TransportError(format!("{}: {}", what, err)));
    }
}

pub struct RtcProvider {
    signals: Rendezvous<Signal>,
    events: EventSender,
    ice_servers: Arc<Vec<ServerConfig>>,
    ctx: Option<RtcContext>,
    signal_task: Option<JoinHandle<()>>,
}

impl RtcProvider {
    pub fn new(signals: Rendezvous<Signal>, events: EventSender, ice_servers: Vec<ServerConfig>) -> Self {
        Self {
            signals,
            events,
            ice_servers: Arc::new(ice_servers),
            ctx: None,
            signal_task: None,
        }
    }

    fn context(&self, remote: &PeerId) -> std::result::Result<RtcContext, TransportError> {
        let ctx = self.ctx.clone().ok_or(TransportError::NotOpen)?;
        if !ctx.signals.is_online(remote) {
            return Err(TransportError::PeerUnavailable(remote.to_string()));
        }
        Ok(ctx)
    }
}

impl Drop for RtcProvider {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.signals.unregister(&ctx.local);
        }
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

impl PeerProvider for RtcProvider {
    fn start(&mut self) -> std::result::Result<(), TransportError> {
        if self.ctx.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let local = self.signals.register(tx);
        let ctx = RtcContext {
            local: local.clone(),
            signals: self.signals.clone(),
            events: self.events.clone(),
            ice_servers: self.ice_servers.clone(),
            pending: Arc::default(),
        };

        self.signal_task = Some(tokio::spawn(serve_signals(ctx.clone(), rx)));
        self.ctx = Some(ctx);
        self.events
            .send(PeerEvent::IdentityAssigned(local))
            .map_err(|_| TransportError::Closed)
    }

    fn connect(&mut self, remote: &PeerId) -> std::result::Result<Arc<dyn DataLink>, TransportError> {
        let ctx = self.context(remote)?;
        let link = RtcDataLink::new(remote.clone(), ctx.events.clone());

        let remote = remote.clone();
        let dialing = link.clone();
        tokio::spawn(async move {
            if let Err(e) = dial(&ctx, &remote, &dialing).await {
                dialing.report_closed();
                ctx.report("Connect", e);
            }
        });
        Ok(link)
    }

    fn call(
        &mut self,
        remote: &PeerId,
        stream: &LocalStream,
    ) -> std::result::Result<Arc<dyn MediaLink>, TransportError> {
        let ctx = self.context(remote)?;
        let link = RtcMediaLink::outgoing(remote.clone(), ctx.events.clone());

        let remote = remote.clone();
        let calling = link.clone();
        let track = stream.track() as Arc<dyn TrackLocal + Send + Sync>;
        tokio::spawn(async move {
            if let Err(e) = place_call(&ctx, &remote, &calling, track).await {
                tracing::warn!("Call to {} failed: {}", remote, e);
                calling.report_closed();
            }
        });
        Ok(link)
    }
}

fn on_data_down(link: &Arc<RtcDataLink>) -> impl Fn() + Send + Sync + 'static {
    let weak: Weak<RtcDataLink> = Arc::downgrade(link);
    move || {
        if let Some(link) = weak.upgrade() {
            link.report_closed();
        }
    }
}

fn on_media_down(link: &Arc<RtcMediaLink>) -> impl Fn() + Send + Sync + 'static {
    let weak: Weak<RtcMediaLink> = Arc::downgrade(link);
    move || {
        if let Some(link) = weak.upgrade() {
            link.report_closed();
        }
    }
}

/// `on_down` that also drops the offer `negotiation` from the pending table.
fn forget_on_down<F>(ctx: &RtcContext, negotiation: &str, on_down: F) -> impl Fn() + Send + Sync + 'static
where
    F: Fn() + Send + Sync + 'static,
{
    let pending = Arc::downgrade(&ctx.pending);
    let negotiation = negotiation.to_string();
    move || {
        if let Some(pending) = pending.upgrade() {
            pending.lock().remove(&negotiation);
        }
        on_down();
    }
}

async fn send_offer(
    ctx: &RtcContext,
    remote: &PeerId,
    pc: Arc<RTCPeerConnection>,
    kind: ChannelKind,
    negotiation: String,
    hangup: Box<dyn Fn() + Send + Sync>,
) -> Result<()> {
    let bundle = offer_bundle(&pc, kind, &negotiation).await?;

    // Closed while gathering; its close already ran `forget_on_down`
    if pc.connection_state() == RTCPeerConnectionState::Closed {
        tracing::debug!("{:?} offer {} dropped before sending", kind, negotiation);
        return Ok(());
    }

    ctx.pending.lock().insert(
        negotiation,
        PendingOffer {
            remote: remote.clone(),
            pc,
            hangup,
        },
    );
    ctx.signals.deliver(
        remote,
        Signal::Bundle {
            from: ctx.local.clone(),
            bundle,
        },
    )?;
    Ok(())
}

async fn dial(ctx: &RtcContext, remote: &PeerId, link: &Arc<RtcDataLink>) -> Result<()> {
    let negotiation = random_id();
    let pc = new_peer(&ctx.ice_servers, forget_on_down(ctx, &negotiation, on_data_down(link))).await?;
    link.set_peer_connection(pc.clone());

    let dc = pc
        .create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
        .await?;
    attach_dc(&dc, link, Side::Dialer);

    let hangup = Box::new(on_data_down(link));
    send_offer(ctx, remote, pc, ChannelKind::Data, negotiation, hangup).await
}

async fn place_call(
    ctx: &RtcContext,
    remote: &PeerId,
    link: &Arc<RtcMediaLink>,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<()> {
    let negotiation = random_id();
    let pc = new_peer(&ctx.ice_servers, forget_on_down(ctx, &negotiation, on_media_down(link))).await?;
    link.attach(pc.clone());
    pc.add_track(track).await?;

    let hangup = Box::new(on_media_down(link));
    send_offer(ctx, remote, pc, ChannelKind::Media, negotiation, hangup).await
}

async fn serve_signals(ctx: RtcContext, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        let (from, encoded) = match signal {
            Signal::Bundle { from, bundle } => (from, bundle),
            Signal::Hangup { from, negotiation } => {
                abandon_offer(&ctx, &from, &negotiation);
                continue;
            }
        };

        let bundle: SignalBundle = match codec::decode(&encoded) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!("Dropping bad signal from {}: {}", from, e);
                continue;
            }
        };

        let result = match bundle.sdp_payload.sdp.sdp_type {
            RTCSdpType::Offer => match bundle.kind {
                ChannelKind::Data => accept_data(&ctx, from.clone(), bundle).await,
                ChannelKind::Media => accept_call(&ctx, from.clone(), bundle).await,
            },
            RTCSdpType::Answer => complete_offer(&ctx, &from, bundle).await,
            other => {
                tracing::debug!("Ignoring {:?} signal from {}", other, from);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Signal from {} failed: {}", from, e);
        }
    }
}

/// Removes the offer `negotiation` if `from` is the peer it went to.
fn take_offer(ctx: &RtcContext, from: &PeerId, negotiation: &str) -> Option<PendingOffer> {
    let mut pending = ctx.pending.lock();
    match pending.get(negotiation) {
        Some(offer) if offer.remote == *from => pending.remove(negotiation),
        _ => None,
    }
}

async fn complete_offer(ctx: &RtcContext, from: &PeerId, bundle: SignalBundle) -> Result<()> {
    match take_offer(ctx, from, &bundle.sdp_payload.id) {
        Some(offer) => {
            offer.pc.set_remote_description(bundle.sdp_payload.sdp).await?;
            Ok(())
        }
        None => {
            tracing::debug!("Answer for unknown negotiation {}", bundle.sdp_payload.id);
            Ok(())
        }
    }
}

fn abandon_offer(ctx: &RtcContext, from: &PeerId, negotiation: &str) {
    match take_offer(ctx, from, negotiation) {
        Some(offer) => {
            tracing::info!("{} hung up on offer {}", from, negotiation);
            (offer.hangup)();
        }
        None => tracing::debug!("Hangup for unknown negotiation {} from {}", negotiation, from),
    }
}

async fn accept_data(ctx: &RtcContext, from: PeerId, bundle: SignalBundle) -> Result<()> {
    let link = RtcDataLink::new(from.clone(), ctx.events.clone());
    let pc = new_peer(&ctx.ice_servers, on_data_down(&link)).await?;

    // Taken by the first channel; the link then lives in the channel handlers
    let slot = Mutex::new(Some(link.clone()));
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        if let Some(link) = slot.lock().take() {
            attach_dc(&dc, &link, Side::Acceptor);
        }
        Box::pin(async {})
    }));
    link.set_peer_connection(pc.clone());

    pc.set_remote_description(bundle.sdp_payload.sdp).await?;
    let answer = answer_bundle(&pc, ChannelKind::Data, &bundle.sdp_payload.id).await?;
    ctx.signals.deliver(
        &from,
        Signal::Bundle {
            from: ctx.local.clone(),
            bundle: answer,
        },
    )?;
    Ok(())
}

async fn accept_call(ctx: &RtcContext, from: PeerId, bundle: SignalBundle) -> Result<()> {
    let route = AnswerRoute {
        offer: bundle.sdp_payload.sdp,
        negotiation: bundle.sdp_payload.id,
        local: ctx.local.clone(),
        signals: ctx.signals.clone(),
    };
    let link = RtcMediaLink::incoming(from, ctx.events.clone(), route);
    let pc = new_peer(&ctx.ice_servers, on_media_down(&link)).await?;
    link.attach(pc);

    ctx.events
        .send(PeerEvent::IncomingCall(link))
        .map_err(|_| TransportError::Closed)?;
    Ok(())
}
