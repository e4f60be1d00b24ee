use std::collections::HashMap;

use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tracing::debug;

use parley_types::{Frame, PeerDetail, PeerId};

/// Sending half of a peer's outbound queue.
pub type PeerSender = mpsc::UnboundedSender<Outbound>;

/// A frame queued for one peer's socket.
///
/// Paced frames hold a permit from their stream's window until the
/// connection has written them, so a re-stream stays at most one window
/// ahead of the socket.
#[derive(Debug)]
pub struct Outbound {
    pub frame: Frame,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Outbound {
    pub fn paced(frame: Frame, permit: OwnedSemaphorePermit) -> Self {
        Self {
            frame,
            _permit: Some(permit),
        }
    }
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Self {
            frame,
            _permit: None,
        }
    }
}

/// A connected peer and its outbound channel.
struct PeerEntry {
    detail: PeerDetail,
    tx: PeerSender,
}

/// Connected peers keyed by id. A peer belongs to exactly one room, recorded
/// in its detail; room membership is derived from that field.
#[derive(Default)]
pub struct RoomRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a canonical id not used by any connected peer.
    pub fn allocate_id(&self) -> PeerId {
        loop {
            let id = PeerId::generate();
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, detail: PeerDetail, tx: PeerSender) {
        self.peers
            .insert(detail.peer_id.clone(), PeerEntry { detail, tx });
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerDetail> {
        self.peers.remove(peer_id).map(|e| e.detail)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerDetail> {
        self.peers.get(peer_id).map(|e| &e.detail)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Whether `peer_id` is connected and currently in `room_id`.
    pub fn in_room(&self, peer_id: &PeerId, room_id: &str) -> bool {
        self.get(peer_id).is_some_and(|d| d.room_id == room_id)
    }

    /// Move a peer to another room. Returns the room it left.
    pub fn set_room(&mut self, peer_id: &PeerId, room_id: &str) -> Option<String> {
        let entry = self.peers.get_mut(peer_id)?;
        let old = std::mem::replace(&mut entry.detail.room_id, room_id.to_string());
        Some(old)
    }

    /// Details of every peer in `room_id` except `exclude`, ordered by id.
    pub fn room_members(&self, room_id: &str, exclude: Option<&PeerId>) -> Vec<PeerDetail> {
        let mut members: Vec<PeerDetail> = self
            .peers
            .values()
            .filter(|e| e.detail.room_id == room_id && Some(&e.detail.peer_id) != exclude)
            .map(|e| e.detail.clone())
            .collect();
        members.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        members
    }

    /// Queue a frame for one peer. Returns false if the peer is unknown or
    /// its channel is closed.
    pub fn send_to(&self, peer_id: &PeerId, frame: Frame) -> bool {
        match self.peers.get(peer_id) {
            Some(entry) => entry.tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Outbound channel of a peer, for work that outlives the current turn.
    pub fn sender(&self, peer_id: &PeerId) -> Option<PeerSender> {
        self.peers.get(peer_id).map(|e| e.tx.clone())
    }

    /// Send a frame to every peer in `room_id` except `exclude`.
    pub fn broadcast(&self, room_id: &str, exclude: Option<&PeerId>, frame: &Frame) -> usize {
        let mut delivered = 0;
        for entry in self.peers.values() {
            if entry.detail.room_id != room_id || Some(&entry.detail.peer_id) == exclude {
                continue;
            }
            if entry.tx.send(frame.clone().into()).is_ok() {
                delivered += 1;
            }
        }
        debug!("broadcast {} to {} peers in {}", frame.kind, delivered, room_id);
        delivered
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
