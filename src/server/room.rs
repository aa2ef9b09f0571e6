//! Two-slot pairing context. The initiator slot is filled at creation; the
//! joiner slot by the first successful `join_room`. All mutation happens on
//! the hub loop.

use uuid::Uuid;

pub type PeerId = Uuid;

#[derive(Debug)]
pub struct Room {
    pub initiator: Option<PeerId>,
    pub joiner: Option<PeerId>,
}

impl Room {
    pub fn new(initiator: PeerId) -> Self {
        Room {
            initiator: Some(initiator),
            joiner: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.joiner.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.initiator.is_none() && self.joiner.is_none()
    }

    /// The peer in the other slot, if that slot is occupied.
    pub fn counterpart(&self, peer: PeerId) -> Option<PeerId> {
        if self.initiator == Some(peer) {
            self.joiner
        } else if self.joiner == Some(peer) {
            self.initiator
        } else {
            None
        }
    }

    /// Clear whichever slot the peer occupies. Returns false if the peer is
    /// in neither slot.
    pub fn vacate(&mut self, peer: PeerId) -> bool {
        if self.initiator == Some(peer) {
            self.initiator = None;
            true
        } else if self.joiner == Some(peer) {
            self.joiner = None;
            true
        } else {
            false
        }
    }
}
