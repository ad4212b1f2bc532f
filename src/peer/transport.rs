//! Seams between the coordinator and whatever carries the bytes.
//!
//! A transport hands the coordinator link handles and posts everything that
//! happens on them as [`PeerEvent`]s into the coordinator's queue. Handles
//! never call back into the coordinator directly.

use crate::audio::LocalStream;
use crate::error::TransportError;
use crate::peer::types::{LinkId, PeerId, RemoteStream};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reliable message link to one remote peer
pub trait DataLink: Send + Sync {
    fn id(&self) -> LinkId;

    fn peer(&self) -> &PeerId;

    /// Best-effort send; fails only when the link is known to be unusable.
    fn send(&self, payload: &str) -> Result<(), TransportError>;

    /// Closes both ends. Idempotent; the transport reports `ConnectionClosed`.
    fn close(&self);
}

/// Audio call to one remote peer, negotiated separately from the data link
pub trait MediaLink: Send + Sync {
    fn id(&self) -> LinkId;

    fn peer(&self) -> &PeerId;

    /// Accepts an inbound call. `None` answers receive-only.
    fn answer(&self, stream: Option<&LocalStream>) -> Result<(), TransportError>;

    /// Closes the call. Idempotent; the transport reports `CallClosed`.
    fn close(&self);

    /// Swaps the outbound audio track without renegotiating.
    /// Resolves to `false` when the link has no audio sender.
    fn replace_audio_track(&self, stream: &LocalStream)
        -> BoxFuture<'static, Result<bool, TransportError>>;
}

/// Identity assignment and link creation
pub trait PeerProvider: Send {
    /// Registers with the rendezvous. The identity arrives later as
    /// [`PeerEvent::IdentityAssigned`].
    fn start(&mut self) -> Result<(), TransportError>;

    /// Opens a data link; `ConnectionOpened` follows once it is usable.
    fn connect(&mut self, remote: &PeerId) -> Result<Arc<dyn DataLink>, TransportError>;

    /// Places an audio call carrying `stream`.
    fn call(
        &mut self,
        remote: &PeerId,
        stream: &LocalStream,
    ) -> Result<Arc<dyn MediaLink>, TransportError>;
}

impl<P: PeerProvider + ?Sized> PeerProvider for Box<P> {
    fn start(&mut self) -> Result<(), TransportError> {
        (**self).start()
    }

    fn connect(&mut self, remote: &PeerId) -> Result<Arc<dyn DataLink>, TransportError> {
        (**self).connect(remote)
    }

    fn call(
        &mut self,
        remote: &PeerId,
        stream: &LocalStream,
    ) -> Result<Arc<dyn MediaLink>, TransportError> {
        (**self).call(remote, stream)
    }
}

/// Everything a transport reports to the coordinator
pub enum PeerEvent {
    IdentityAssigned(PeerId),
    IncomingConnection(Arc<dyn DataLink>),
    ConnectionOpened(LinkId),
    Data { link: LinkId, payload: String },
    ConnectionClosed(LinkId),
    IncomingCall(Arc<dyn MediaLink>),
    RemoteStream { link: LinkId, stream: RemoteStream },
    CallClosed(LinkId),
    TransportError(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IdentityAssigned(id) => write!(f, "IdentityAssigned({id})"),
            PeerEvent::IncomingConnection(link) => {
                write!(f, "IncomingConnection({} from {})", link.id(), link.peer())
            }
            PeerEvent::ConnectionOpened(link) => write!(f, "ConnectionOpened({link})"),
            PeerEvent::Data { link, payload } => write!(f, "Data({link}, {payload:?})"),
            PeerEvent::ConnectionClosed(link) => write!(f, "ConnectionClosed({link})"),
            PeerEvent::IncomingCall(link) => {
                write!(f, "IncomingCall({} from {})", link.id(), link.peer())
            }
            PeerEvent::RemoteStream { link, stream } => {
                write!(f, "RemoteStream({link}, {})", stream.id)
            }
            PeerEvent::CallClosed(link) => write!(f, "CallClosed({link})"),
            PeerEvent::TransportError(err) => write!(f, "TransportError({err})"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<PeerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
