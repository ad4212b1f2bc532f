//! Connection state owned by the coordinator.

use crate::audio::LocalStream;
use crate::peer::{DataLink, LinkId, MediaLink, PeerId};
use std::sync::Arc;

/// Which side of the active session we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    /// Accepted an inbound connection
    Host,
    /// Our outbound connection opened
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaState {
    #[default]
    Absent,
    /// We placed the call
    Offering,
    /// We answered an inbound call
    Answering,
    /// Remote audio is playing
    Streaming,
    /// Last call ended
    Closed,
}

/// Session lifecycle derived from the role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HostActive,
    ClientActive,
}

/// Links taken out of the session by [`Session::reset`], still open.
pub struct Released {
    pub data: Option<Arc<dyn DataLink>>,
    pub dialing: Option<Arc<dyn DataLink>>,
    pub media: Option<Arc<dyn MediaLink>>,
    pub early_call: Option<Arc<dyn MediaLink>>,
}

/// At most one active data link and one media link, plus the inbound links
/// waiting for rejection while a session is active.
#[derive(Default)]
pub struct Session {
    pub(crate) local_identity: Option<PeerId>,
    pub(crate) role: Role,
    pub(crate) data_channel: Option<Arc<dyn DataLink>>,
    /// Outbound link that has not opened yet
    pub(crate) dialing: Option<Arc<dyn DataLink>>,
    pub(crate) media_channel: Option<Arc<dyn MediaLink>>,
    /// Call from the peer we are dialing that arrived before our link opened
    pub(crate) early_call: Option<Arc<dyn MediaLink>>,
    pub(crate) media_state: MediaState,
    pub(crate) local_stream: Option<LocalStream>,
    pub(crate) pending_rejects: Vec<Arc<dyn DataLink>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_identity(&self) -> Option<&PeerId> {
        self.local_identity.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        match self.role {
            Role::None => Phase::Idle,
            Role::Host => Phase::HostActive,
            Role::Client => Phase::ClientActive,
        }
    }

    pub fn media_state(&self) -> MediaState {
        self.media_state
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    /// Remote end of the active data link
    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.data_channel.as_ref().map(|link| link.peer())
    }

    pub fn has_data_channel(&self) -> bool {
        self.data_channel.is_some()
    }

    pub fn has_media_channel(&self) -> bool {
        self.media_channel.is_some()
    }

    pub fn is_dialing(&self) -> bool {
        self.dialing.is_some()
    }

    pub fn has_early_call(&self) -> bool {
        self.early_call.is_some()
    }

    pub fn pending_rejects(&self) -> usize {
        self.pending_rejects.len()
    }

    /// Holds between events: no role means no links, a data link is never
    /// also waiting in the reject queue, and a parked call belongs to the
    /// peer being dialed.
    pub fn invariants_hold(&self) -> bool {
        let idle = self.role == Role::None;
        let linkless = self.data_channel.is_none() && self.media_channel.is_none();
        let not_queued = self.data_channel.as_ref().map_or(true, |active| {
            self.pending_rejects
                .iter()
                .all(|queued| queued.id() != active.id())
        });
        let parked = self.early_call.as_ref().map_or(true, |call| {
            self.dialing
                .as_ref()
                .is_some_and(|dial| dial.peer() == call.peer())
        });

        idle == linkless && not_queued && parked
    }

    pub(crate) fn is_active_link(&self, id: LinkId) -> bool {
        self.data_channel.as_ref().is_some_and(|link| link.id() == id)
    }

    pub(crate) fn is_dialing_link(&self, id: LinkId) -> bool {
        self.dialing.as_ref().is_some_and(|link| link.id() == id)
    }

    pub(crate) fn is_media_link(&self, id: LinkId) -> bool {
        self.media_channel.as_ref().is_some_and(|link| link.id() == id)
    }

    #[cfg(test)]
    pub(crate) fn is_queued(&self, id: LinkId) -> bool {
        self.pending_rejects.iter().any(|link| link.id() == id)
    }

    /// Drops a queued link; true when it was there.
    pub(crate) fn forget_queued(&mut self, id: LinkId) -> bool {
        let before = self.pending_rejects.len();
        self.pending_rejects.retain(|link| link.id() != id);
        before != self.pending_rejects.len()
    }

    pub(crate) fn is_early_call(&self, id: LinkId) -> bool {
        self.early_call.as_ref().is_some_and(|call| call.id() == id)
    }

    /// Takes the unopened outbound link and any call parked behind it.
    pub(crate) fn take_dialing(&mut self) -> (Option<Arc<dyn DataLink>>, Option<Arc<dyn MediaLink>>) {
        (self.dialing.take(), self.early_call.take())
    }

    pub(crate) fn drain_rejects(&mut self) -> Vec<Arc<dyn DataLink>> {
        std::mem::take(&mut self.pending_rejects)
    }

    /// Back to idle. The reject queue and local stream survive.
    pub(crate) fn reset(&mut self) -> Released {
        self.role = Role::None;
        let released = Released {
            data: self.data_channel.take(),
            dialing: self.dialing.take(),
            media: self.media_channel.take(),
            early_call: self.early_call.take(),
        };
        if released.media.is_some() {
            self.media_state = MediaState::Closed;
        }
        released
    }
}
