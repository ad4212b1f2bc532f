use crate::error::TransportError;
use crate::peer::transport::{DataLink, EventSender, PeerEvent};
use crate::peer::types::{LinkId, PeerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::data_channel::{data_channel_message::DataChannelMessage, RTCDataChannel};
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the single data channel every data link negotiates
pub const DATA_CHANNEL_LABEL: &str = "teapot-data";

/// Which end of the negotiation a link sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Created the channel; reports `ConnectionOpened` when it opens.
    Dialer,
    /// Received the channel; reports `IncomingConnection` when it opens.
    Acceptor,
}

/// Data link over one `RTCPeerConnection` and its data channel.
///
/// Sends queue up until the channel opens and then go out in order.
pub struct RtcDataLink {
    id: LinkId,
    peer: PeerId,
    events: EventSender,
    closed: AtomicBool,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
}

impl RtcDataLink {
    pub fn new(peer: PeerId, events: EventSender) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: LinkId::next(),
            peer,
            events,
            closed: AtomicBool::new(false),
            outbox: Mutex::new(Some(tx)),
            outbox_rx: Mutex::new(Some(rx)),
            channel: Mutex::new(None),
            pc: Mutex::new(None),
        })
    }

    pub fn set_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        if self.closed.load(Ordering::SeqCst) {
            close_later(None, Some(pc));
        } else {
            *self.pc.lock() = Some(pc);
        }
    }

    /// Reports the link as gone, once, and tears the connection down.
    pub fn report_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Data link {} to {} closed", self.id, self.peer);
        let _ = self.events.send(PeerEvent::ConnectionClosed(self.id));
        self.release();
    }

    fn release(&self) {
        self.outbox.lock().take();
        let dc = self.channel.lock().take();
        let pc = self.pc.lock().take();
        close_later(dc, pc);
    }
}

fn close_later(dc: Option<Arc<RTCDataChannel>>, pc: Option<Arc<RTCPeerConnection>>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No runtime to close the peer connection on");
        return;
    };
    runtime.spawn(async move {
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::debug!("Peer connection close failed: {}", e);
            }
        }
    });
}

impl DataLink for RtcDataLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn send(&self, payload: &str) -> Result<(), TransportError> {
        let outbox = self.outbox.lock();
        match outbox.as_ref() {
            Some(tx) => tx
                .send(payload.to_string())
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.report_closed();
    }
}

async fn write_outbox(dc: Arc<RTCDataChannel>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = dc.send_text(text).await {
            tracing::warn!("Data channel send failed: {}", e);
        }
    }
}

/// Wires a data channel to its link: open, messages and close all become
/// events in the link owner's queue.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, link: &Arc<RtcDataLink>, side: Side) {
    *link.channel.lock() = Some(dc.clone());

    // An accepted link has no other owner until it is announced
    let announce = Mutex::new(match side {
        Side::Acceptor => Some(link.clone()),
        Side::Dialer => None,
    });
    let weak: Weak<RtcDataLink> = Arc::downgrade(link);

    dc.on_open(Box::new({
        let dc = dc.clone();
        let weak = weak.clone();
        move || {
            let link = match announce.lock().take() {
                Some(link) => Some(link),
                None => weak.upgrade(),
            };
            if let Some(link) = link {
                tracing::debug!("Data channel {} open ({:?})", link.id, side);
                if let Some(rx) = link.outbox_rx.lock().take() {
                    tokio::spawn(write_outbox(dc.clone(), rx));
                }
                let event = match side {
                    Side::Dialer => PeerEvent::ConnectionOpened(link.id),
                    Side::Acceptor => PeerEvent::IncomingConnection(link.clone()),
                };
                let _ = link.events.send(event);
            }
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let weak = weak.clone();
        move |msg: DataChannelMessage| {
            if let Some(link) = weak.upgrade() {
                if !msg.is_string {
                    tracing::debug!("Ignoring {} binary bytes on {}", msg.data.len(), link.id);
                } else {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(payload) => {
                            let _ = link.events.send(PeerEvent::Data {
                                link: link.id,
                                payload,
                            });
                        }
                        Err(e) => tracing::warn!("Non UTF-8 text on {}: {}", link.id, e),
                    }
                }
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        if let Some(link) = weak.upgrade() {
            link.report_closed();
        }
        Box::pin(async {})
    }));
}
