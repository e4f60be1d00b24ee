//! Database row types. These map directly to SQLite rows and are kept
//! separate from the parley-types wire models.

use chrono::{DateTime, Utc};
use parley_types::{FileMeta, Frame, PeerId};

use crate::error::Result;

/// Which per-room log an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Chat messages and file announcements.
    History,
    /// Stream-control events (promote, demote, stop sharing, stream update).
    Event,
}

impl LogKind {
    pub fn log_name(self, room_id: &str) -> String {
        match self {
            Self::History => format!("history_{}", room_id),
            Self::Event => format!("event_{}", room_id),
        }
    }
}

pub struct LogRow {
    pub seq: i64,
    pub id: String,
    pub parent_id: Option<String>,
    pub room_id: String,
    pub participant_id: Option<String>,
    pub message_type: String,
    pub frame: String,
    pub created_at: String,
}

impl LogRow {
    /// The frame exactly as it was stored.
    pub fn frame(&self) -> Result<Frame> {
        Ok(Frame::parse(&self.frame)?)
    }

    pub fn created_at(&self) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc))
    }
}

pub struct FileMetaRow {
    pub file_id: String,
    pub room_id: String,
    pub participant_id: Option<String>,
    pub name: String,
    pub extension: String,
    pub mime_type: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub complete: bool,
    pub realtime: bool,
    pub bytes_received: i64,
    pub created_at: String,
}

impl FileMetaRow {
    /// The stored record as a wire meta. Stored files are never realtime.
    pub fn to_meta(&self) -> FileMeta {
        FileMeta {
            file_id: self.file_id.clone(),
            name: self.name.clone(),
            extension: self.extension.clone(),
            size: self.total_size.max(0) as u64,
            mime_type: self.mime_type.clone(),
            chunk_size: self.chunk_size.max(0) as u64,
            realtime: self.realtime,
            complete: self.complete,
            from: self.participant_id.as_deref().map(PeerId::new),
        }
    }
}
