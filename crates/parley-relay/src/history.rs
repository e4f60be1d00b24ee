use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use parley_store::LogKind;
use parley_types::{ChatEvent, ChatMessage, Frame, FrameType, PeerId};

use crate::relay::Relay;

impl Relay {
    /// Append a relayed frame to the room's history or event log. Storage
    /// failures are logged; they never block relaying.
    pub(crate) fn persist(&self, room: &str, peer_id: &PeerId, kind: FrameType, frame: &Frame) {
        let result = if kind.is_history() {
            let message = chat_entry(room, peer_id, kind, frame);
            self.db.append_chat(&message, frame)
        } else if kind.is_stream_control() {
            let event = ChatEvent {
                id: frame
                    .str_field("eventId")
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                room_id: room.to_string(),
                participant_id: Some(peer_id.clone()),
                message_type: kind.as_str().to_string(),
                created_at: Utc::now(),
            };
            self.db.append_event(&event, frame)
        } else {
            return;
        };

        if let Err(e) = result {
            warn!("failed to log {} for room {}: {}", frame.kind, room, e);
        }
    }

    /// The room's history, oldest first. File announcements are replaced by
    /// the stored record so replays reflect completion and realtime=false.
    pub(crate) fn history_frames(&self, room: &str) -> Vec<Frame> {
        let rows = match self.db.read_log(LogKind::History, room) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("failed to read history for room {}: {}", room, e);
                return Vec::new();
            }
        };

        rows.iter()
            .filter_map(|row| match row.frame() {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!("skipping unreadable history entry {}: {}", row.id, e);
                    None
                }
            })
            .map(|frame| self.expand_meta(frame))
            .collect()
    }

    /// The room's stream-control events, oldest first.
    pub(crate) fn event_frames(&self, room: &str) -> Vec<Frame> {
        match self.db.read_log(LogKind::Event, room) {
            Ok(rows) => rows.iter().filter_map(|row| row.frame().ok()).collect(),
            Err(e) => {
                warn!("failed to read events for room {}: {}", room, e);
                Vec::new()
            }
        }
    }

    fn expand_meta(&self, frame: Frame) -> Frame {
        if !frame.is(FrameType::FileMeta) {
            return frame;
        }
        let Some(file_id) = frame.str_field("fileId") else {
            return frame;
        };
        match self.db.get_file_meta(file_id) {
            Ok(Some(row)) => Frame::encode(FrameType::FileMeta, &row.to_meta()).unwrap_or(frame),
            Ok(None) => frame,
            Err(e) => {
                warn!("failed to load meta for {}: {}", file_id, e);
                frame
            }
        }
    }
}

fn chat_entry(room: &str, peer_id: &PeerId, kind: FrameType, frame: &Frame) -> ChatMessage {
    let (id, text) = if kind == FrameType::FileMeta {
        (
            frame.str_field("fileId").map(str::to_string),
            frame.str_field("name").unwrap_or_default().to_string(),
        )
    } else {
        (
            frame.str_field("messageId").map(str::to_string),
            frame.str_field("text").unwrap_or_default().to_string(),
        )
    };

    ChatMessage {
        id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        parent_id: frame.str_field("parentId").map(str::to_string),
        room_id: room.to_string(),
        participant_id: Some(peer_id.clone()),
        kind: kind.as_str().to_string(),
        text,
        created_at: Utc::now(),
    }
}
