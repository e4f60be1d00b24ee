use serde::Deserialize;
use tracing::{debug, info, warn};

use parley_store::{ContentStore, Database};
use parley_types::{DEFAULT_CHUNK_SIZE, DEFAULT_ROOM, Frame, FrameType, JoinRoom, MAX_CHUNK_SIZE, PeerDetail, PeerId};

use crate::registry::{PeerSender, RoomRegistry};

/// Query parameters accepted when a channel is opened.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "roomId", default)]
    pub room_id: Option<String>,
    #[serde(default, alias = "PHPSESSID")]
    pub session: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ConnectParams {
    pub fn room(&self) -> &str {
        match self.room_id.as_deref() {
            Some(room) if !room.is_empty() => room,
            _ => DEFAULT_ROOM,
        }
    }

    /// Public detail for a peer opening a channel with these parameters.
    pub fn detail(&self, peer_id: PeerId) -> PeerDetail {
        let mut detail = PeerDetail::guest(peer_id, self.room(), self.session.clone());
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            detail.name = name.to_string();
            detail.username = name.to_lowercase();
        }
        detail
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Chunk size used when a stored file has none, or an out-of-range one.
    pub default_chunk_size: u64,
    /// Largest chunk size honored when re-streaming a stored file.
    pub max_chunk_size: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl RelayConfig {
    pub fn clamp_chunk_size(&self, stored: i64) -> u64 {
        if stored > 0 && (stored as u64) <= self.max_chunk_size {
            stored as u64
        } else {
            self.default_chunk_size
        }
    }
}

/// Relay state: connected peers, their rooms and durable storage.
///
/// One `Relay` is owned by one task. Every method runs to completion before
/// the next inbound event is looked at, so frames from a single peer are
/// handled in arrival order and membership changes are never interleaved.
pub struct Relay {
    pub(crate) registry: RoomRegistry,
    pub(crate) db: Database,
    pub(crate) store: ContentStore,
    pub(crate) config: RelayConfig,
}

impl Relay {
    pub fn new(db: Database, store: ContentStore, config: RelayConfig) -> Self {
        Self {
            registry: RoomRegistry::new(),
            db,
            store,
            config,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Admit a new peer. It receives the room snapshot first; everyone else
    /// in the room then learns about it.
    pub fn on_connect(
        &mut self,
        params: &ConnectParams,
        tx: PeerSender,
    ) -> PeerId {
        let peer_id = self.registry.allocate_id();
        let detail = params.detail(peer_id.clone());
        let room = detail.room_id.clone();

        let others = self.registry.room_members(&room, None);
        self.registry.insert(detail.clone(), tx);
        self.registry.send_to(&peer_id, Frame::peers(&peer_id, &others));
        self.registry
            .broadcast(&room, Some(&peer_id), &Frame::new_peer(&detail));

        info!("{} joined room {} ({} others)", peer_id, room, others.len());
        peer_id
    }

    /// Forget a peer and tell its room.
    pub fn on_disconnect(&mut self, peer_id: &PeerId) {
        let Some(detail) = self.registry.remove(peer_id) else {
            return;
        };
        self.registry
            .broadcast(&detail.room_id, None, &Frame::peer_leave(peer_id));
        info!("{} left room {}", peer_id, detail.room_id);
    }

    /// Handle one text frame from a connected peer.
    pub async fn on_message(&mut self, peer_id: &PeerId, text: &str) {
        let Some(room) = self.registry.get(peer_id).map(|d| d.room_id.clone()) else {
            debug!("frame from unknown peer {}", peer_id);
            return;
        };

        let mut frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "{} sent a malformed frame: {} -- raw: {}",
                    peer_id,
                    e,
                    text.chars().take(200).collect::<String>()
                );
                return;
            }
        };
        if frame.kind.is_empty() {
            warn!("{} sent a frame without a type", peer_id);
            return;
        }
        frame.from = Some(peer_id.clone());
        let kind = frame.frame_type();

        match frame.target().cloned() {
            Some(target) => self.deliver_direct(peer_id, &room, &target, &frame),
            None => self.route(peer_id, &room, kind, &frame).await,
        }

        if let Some(kind) = kind {
            self.persist(&room, peer_id, kind, &frame);
        }
    }

    fn deliver_direct(&self, sender: &PeerId, room: &str, target: &PeerId, frame: &Frame) {
        if !self.registry.in_room(target, room) {
            debug!(
                "dropping {} from {}: {} is not in room {}",
                frame.kind, sender, target, room
            );
            return;
        }
        self.registry.send_to(target, frame.clone());
    }

    async fn route(&mut self, peer_id: &PeerId, room: &str, kind: Option<FrameType>, frame: &Frame) {
        match kind {
            Some(FrameType::SetMainScreen) => {
                let rebuilt = Frame::new(FrameType::SetMainScreen)
                    .from_peer(peer_id.clone())
                    .with("streamId", frame.body.get("streamId"));
                self.registry.broadcast(room, Some(peer_id), &rebuilt);
            }
            Some(FrameType::RequestChatHistory) => {
                let entries = self.history_frames(room);
                self.registry.send_to(peer_id, Frame::chat_history(entries));
            }
            Some(FrameType::RequestChatEvent) => {
                let entries = self.event_frames(room);
                self.registry.send_to(peer_id, Frame::chat_event(entries));
            }
            Some(FrameType::FileRequest) => self.serve_file(peer_id, frame).await,
            Some(FrameType::FileUpdate) => self.file_update(peer_id, frame),
            Some(FrameType::JoinRoom) => {
                let target = frame
                    .decode::<JoinRoom>()
                    .ok()
                    .and_then(|j| j.room_id)
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                self.switch_room(peer_id, &target);
            }
            Some(FrameType::FileMeta) => {
                self.capture_meta(room, frame);
                self.registry.broadcast(room, Some(peer_id), frame);
            }
            Some(FrameType::FileChunk) => {
                self.capture_chunk(frame).await;
                self.registry.broadcast(room, Some(peer_id), frame);
            }
            Some(FrameType::FileComplete) => {
                self.capture_complete(frame).await;
                self.registry.broadcast(room, Some(peer_id), frame);
            }
            Some(
                FrameType::Peers
                | FrameType::NewPeer
                | FrameType::PeerLeave
                | FrameType::ChatHistory
                | FrameType::ChatEvent
                | FrameType::Error,
            ) => {
                warn!("{} sent relay-only frame {}, dropping", peer_id, frame.kind);
            }
            _ => {
                self.registry.broadcast(room, Some(peer_id), frame);
            }
        }
    }

    /// Move a peer to another room, keeping its id.
    pub fn switch_room(&mut self, peer_id: &PeerId, room: &str) {
        let Some(old) = self.registry.set_room(peer_id, room) else {
            return;
        };
        if old != room {
            self.registry
                .broadcast(&old, Some(peer_id), &Frame::peer_leave(peer_id));
        }

        let others = self.registry.room_members(room, Some(peer_id));
        self.registry.send_to(peer_id, Frame::peers(peer_id, &others));

        if old != room {
            if let Some(detail) = self.registry.get(peer_id) {
                let announce = Frame::new_peer(detail);
                self.registry.broadcast(room, Some(peer_id), &announce);
            }
            info!("{} moved from room {} to {}", peer_id, old, room);
        }
    }
}
