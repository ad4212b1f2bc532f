//! In-process transport: every peer lives in this process and links are
//! pairs of handles that post events straight into each other's queues.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::LocalStream;
use crate::error::TransportError;
use crate::peer::rendezvous::Rendezvous;
use crate::peer::transport::{DataLink, EventSender, MediaLink, PeerEvent, PeerProvider};
use crate::peer::types::{LinkId, PeerId, RemoteStream};

pub struct LoopbackProvider {
    rendezvous: Rendezvous<PeerEvent>,
    events: EventSender,
    id: Option<PeerId>,
}

impl LoopbackProvider {
    pub fn new(rendezvous: Rendezvous<PeerEvent>, events: EventSender) -> Self {
        Self {
            rendezvous,
            events,
            id: None,
        }
    }

    fn local_id(&self) -> Result<PeerId, TransportError> {
        self.id.clone().ok_or(TransportError::NotOpen)
    }

    fn ensure_online(&self, remote: &PeerId) -> Result<(), TransportError> {
        if self.rendezvous.is_online(remote) {
            Ok(())
        } else {
            Err(TransportError::PeerUnavailable(remote.to_string()))
        }
    }
}

impl Drop for LoopbackProvider {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.rendezvous.unregister(&id);
        }
    }
}

impl PeerProvider for LoopbackProvider {
    fn start(&mut self) -> Result<(), TransportError> {
        if self.id.is_some() {
            return Ok(());
        }

        let id = self.rendezvous.register(self.events.clone());
        self.id = Some(id.clone());
        self.events
            .send(PeerEvent::IdentityAssigned(id))
            .map_err(|_| TransportError::Closed)
    }

    fn connect(&mut self, remote: &PeerId) -> Result<Arc<dyn DataLink>, TransportError> {
        let local_id = self.local_id()?;
        self.ensure_online(remote)?;

        let closed = Arc::new(AtomicBool::new(false));
        let (near_id, far_id) = (LinkId::next(), LinkId::next());

        let near = Arc::new(LoopbackDataLink {
            id: near_id,
            counterpart: far_id,
            owner: local_id.clone(),
            peer: remote.clone(),
            rendezvous: self.rendezvous.clone(),
            closed: closed.clone(),
        });
        let far = Arc::new(LoopbackDataLink {
            id: far_id,
            counterpart: near_id,
            owner: remote.clone(),
            peer: local_id,
            rendezvous: self.rendezvous.clone(),
            closed,
        });

        self.rendezvous
            .deliver(remote, PeerEvent::IncomingConnection(far))?;
        self.events
            .send(PeerEvent::ConnectionOpened(near_id))
            .map_err(|_| TransportError::Closed)?;

        Ok(near)
    }

    fn call(
        &mut self,
        remote: &PeerId,
        stream: &LocalStream,
    ) -> Result<Arc<dyn MediaLink>, TransportError> {
        let local_id = self.local_id()?;
        self.ensure_online(remote)?;

        let pair = Arc::new(MediaPair {
            closed: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            caller_stream: stream.id().to_string(),
        });
        let (near_id, far_id) = (LinkId::next(), LinkId::next());

        let near = Arc::new(LoopbackMediaLink {
            id: near_id,
            counterpart: far_id,
            owner: local_id.clone(),
            peer: remote.clone(),
            rendezvous: self.rendezvous.clone(),
            pair: pair.clone(),
            outbound: Mutex::new(Some(stream.track_id().to_string())),
        });
        let far = Arc::new(LoopbackMediaLink {
            id: far_id,
            counterpart: near_id,
            owner: remote.clone(),
            peer: local_id,
            rendezvous: self.rendezvous.clone(),
            pair,
            outbound: Mutex::new(None),
        });

        self.rendezvous.deliver(remote, PeerEvent::IncomingCall(far))?;
        Ok(near)
    }
}

/// One end of an in-process data link
pub struct LoopbackDataLink {
    id: LinkId,
    counterpart: LinkId,
    owner: PeerId,
    peer: PeerId,
    rendezvous: Rendezvous<PeerEvent>,
    closed: Arc<AtomicBool>,
}

impl DataLink for LoopbackDataLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn send(&self, payload: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.rendezvous.deliver(
            &self.peer,
            PeerEvent::Data {
                link: self.counterpart,
                payload: payload.to_string(),
            },
        )
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Either side may already be gone
        let _ = self
            .rendezvous
            .deliver(&self.owner, PeerEvent::ConnectionClosed(self.id));
        let _ = self
            .rendezvous
            .deliver(&self.peer, PeerEvent::ConnectionClosed(self.counterpart));
    }
}

struct MediaPair {
    closed: AtomicBool,
    answered: AtomicBool,
    caller_stream: String,
}

/// One end of an in-process audio call
pub struct LoopbackMediaLink {
    id: LinkId,
    counterpart: LinkId,
    owner: PeerId,
    peer: PeerId,
    rendezvous: Rendezvous<PeerEvent>,
    pair: Arc<MediaPair>,
    /// Track id this end transmits, `None` for receive-only
    outbound: Mutex<Option<String>>,
}

impl MediaLink for LoopbackMediaLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn answer(&self, stream: Option<&LocalStream>) -> Result<(), TransportError> {
        if self.pair.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.pair.answered.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Negotiation("call already answered".into()));
        }

        *self.outbound.lock() = stream.map(|s| s.track_id().to_string());

        // Caller's audio arrives here
        self.rendezvous.deliver(
            &self.owner,
            PeerEvent::RemoteStream {
                link: self.id,
                stream: RemoteStream {
                    id: self.pair.caller_stream.clone(),
                    peer: self.peer.clone(),
                },
            },
        )?;

        // ... and ours reaches the caller if we send anything
        if let Some(stream) = stream {
            self.rendezvous.deliver(
                &self.peer,
                PeerEvent::RemoteStream {
                    link: self.counterpart,
                    stream: RemoteStream {
                        id: stream.id().to_string(),
                        peer: self.owner.clone(),
                    },
                },
            )?;
        }

        Ok(())
    }

    fn close(&self) {
        if self.pair.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self
            .rendezvous
            .deliver(&self.owner, PeerEvent::CallClosed(self.id));
        let _ = self
            .rendezvous
            .deliver(&self.peer, PeerEvent::CallClosed(self.counterpart));
    }

    fn replace_audio_track(
        &self,
        stream: &LocalStream,
    ) -> BoxFuture<'static, Result<bool, TransportError>> {
        let result = if self.pair.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            let mut outbound = self.outbound.lock();
            match outbound.as_mut() {
                Some(track) => {
                    *track = stream.track_id().to_string();
                    Ok(true)
                }
                None => Ok(false),
            }
        };

        Box::pin(async move { result })
    }
}
