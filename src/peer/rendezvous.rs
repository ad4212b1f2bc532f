//! In-process rendezvous: hands out identities and routes messages to them.
//!
//! The loopback transport routes [`PeerEvent`](crate::peer::transport::PeerEvent)s
//! through it directly; the webrtc transport routes encoded signaling bundles.

use crate::error::TransportError;
use crate::peer::types::PeerId;
use crate::utils::random_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Rendezvous<M> {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<M>>>>,
}

impl<M> Clone for Rendezvous<M> {
    fn clone(&self) -> Self {
        Self {
            peers: self.peers.clone(),
        }
    }
}

impl<M> Default for Rendezvous<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Rendezvous<M> {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Assigns a fresh identity whose mail goes to `mailbox`.
    pub fn register(&self, mailbox: mpsc::UnboundedSender<M>) -> PeerId {
        let mut peers = self.peers.lock();
        loop {
            let id = PeerId::new(random_id());
            if !peers.contains_key(&id) {
                peers.insert(id.clone(), mailbox);
                tracing::debug!("Rendezvous registered {id}, {} peers online", peers.len());
                return id;
            }
        }
    }

    pub fn unregister(&self, id: &PeerId) {
        if self.peers.lock().remove(id).is_some() {
            tracing::debug!("Rendezvous dropped {id}");
        }
    }

    pub fn is_online(&self, id: &PeerId) -> bool {
        self.peers
            .lock()
            .get(id)
            .is_some_and(|mailbox| !mailbox.is_closed())
    }

    /// Posts `msg` to `to`. Fails when the identity is unknown or its owner is gone.
    pub fn deliver(&self, to: &PeerId, msg: M) -> Result<(), TransportError> {
        let mailbox = self
            .peers
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnavailable(to.to_string()))?;

        mailbox
            .send(msg)
            .map_err(|_| TransportError::PeerUnavailable(to.to_string()))
    }
}
