use crate::audio::LocalStream;
use crate::error::{Result, TransportError};
use crate::peer::connection::answer_bundle;
use crate::peer::rendezvous::Rendezvous;
use crate::peer::rtc::Signal;
use crate::peer::transport::{EventSender, MediaLink, PeerEvent};
use crate::peer::types::{ChannelKind, LinkId, PeerId, RemoteStream};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// What an inbound call needs to send its answer back
pub struct AnswerRoute {
    pub offer: RTCSessionDescription,
    pub negotiation: String,
    pub local: PeerId,
    pub signals: Rendezvous<Signal>,
}

impl AnswerRoute {
    /// Tells the caller this offer will not be answered.
    fn decline(&self, caller: &PeerId) {
        let hangup = Signal::Hangup {
            from: self.local.clone(),
            negotiation: self.negotiation.clone(),
        };
        if let Err(e) = self.signals.deliver(caller, hangup) {
            tracing::debug!("Hangup to {} not delivered: {}", caller, e);
        }
    }
}

/// Audio call over its own `RTCPeerConnection`
pub struct RtcMediaLink {
    id: LinkId,
    peer: PeerId,
    events: EventSender,
    closed: AtomicBool,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    answer_route: Mutex<Option<AnswerRoute>>,
    this: Weak<RtcMediaLink>,
}

impl RtcMediaLink {
    /// A call we place
    pub fn outgoing(peer: PeerId, events: EventSender) -> Arc<Self> {
        Self::build(peer, events, None)
    }

    /// A call offered to us, waiting for `answer`
    pub fn incoming(peer: PeerId, events: EventSender, route: AnswerRoute) -> Arc<Self> {
        Self::build(peer, events, Some(route))
    }

    fn build(peer: PeerId, events: EventSender, route: Option<AnswerRoute>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: LinkId::next(),
            peer,
            events,
            closed: AtomicBool::new(false),
            pc: Mutex::new(None),
            answer_route: Mutex::new(route),
            this: this.clone(),
        })
    }

    /// Binds the peer connection and reports remote audio tracks as streams.
    pub fn attach(&self, pc: Arc<RTCPeerConnection>) {
        let weak = self.this.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if let Some(link) = weak.upgrade() {
                link.remote_track(track);
            }
            Box::pin(async {})
        }));

        if self.closed.load(Ordering::SeqCst) {
            close_pc(pc);
        } else {
            *self.pc.lock() = Some(pc);
        }
    }

    fn remote_track(&self, track: Arc<TrackRemote>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Remote audio track on {} from {}", self.id, self.peer);

        // Playback is the presentation layer's job; keep the receiver drained
        tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });

        let _ = self.events.send(PeerEvent::RemoteStream {
            link: self.id,
            stream: RemoteStream {
                id: format!("remote-{}", self.id),
                peer: self.peer.clone(),
            },
        });
    }

    /// Reports the call as gone, once, and closes the peer connection.
    /// An inbound call closed before `answer` hangs up on the caller.
    pub fn report_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Media link {} to {} closed", self.id, self.peer);
        let unanswered = self.answer_route.lock().take();
        if let Some(route) = unanswered {
            route.decline(&self.peer);
        }
        let _ = self.events.send(PeerEvent::CallClosed(self.id));
        if let Some(pc) = self.pc.lock().take() {
            close_pc(pc);
        }
    }
}

fn close_pc(pc: Arc<RTCPeerConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::debug!("Peer connection close failed: {}", e);
            }
        });
    }
}

async fn send_answer(
    pc: Arc<RTCPeerConnection>,
    peer: &PeerId,
    route: &AnswerRoute,
    track: Option<Arc<dyn TrackLocal + Send + Sync>>,
) -> Result<()> {
    // Added first so the offered audio section picks this sender up
    if let Some(track) = track {
        pc.add_track(track).await?;
    }
    pc.set_remote_description(route.offer.clone()).await?;

    let bundle = answer_bundle(&pc, ChannelKind::Media, &route.negotiation).await?;
    route.signals.deliver(
        peer,
        Signal::Bundle {
            from: route.local.clone(),
            bundle,
        },
    )?;
    Ok(())
}

impl MediaLink for RtcMediaLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn answer(&self, stream: Option<&LocalStream>) -> std::result::Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let route = self
            .answer_route
            .lock()
            .take()
            .ok_or_else(|| TransportError::Negotiation("call already answered".into()))?;
        let pc = self.pc.lock().clone().ok_or(TransportError::NotOpen)?;

        let track = stream.map(|s| s.track() as Arc<dyn TrackLocal + Send + Sync>);
        let peer = self.peer.clone();
        let weak = self.this.clone();
        tokio::spawn(async move {
            if let Err(e) = send_answer(pc, &peer, &route, track).await {
                tracing::warn!("Answering call failed: {}", e);
                route.decline(&peer);
                if let Some(link) = weak.upgrade() {
                    link.report_closed();
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        self.report_closed();
    }

    fn replace_audio_track(
        &self,
        stream: &LocalStream,
    ) -> BoxFuture<'static, std::result::Result<bool, TransportError>> {
        let closed = self.closed.load(Ordering::SeqCst);
        let pc = self.pc.lock().clone();
        let track: Arc<dyn TrackLocal + Send + Sync> = stream.track();

        Box::pin(async move {
            if closed {
                return Err(TransportError::Closed);
            }
            let Some(pc) = pc else {
                return Ok(false);
            };

            for sender in pc.get_senders().await {
                let Some(current) = sender.track().await else {
                    continue;
                };
                if current.kind() == RTPCodecType::Audio {
                    sender.replace_track(Some(track.clone())).await?;
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }
}
