use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, PeerId};

/// Public description of a connected peer, as shared with the rest of its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDetail {
    pub peer_id: PeerId,
    pub username: String,
    pub name: String,
    pub session: Option<String>,
    pub room_id: String,
}

impl PeerDetail {
    /// Detail for a peer with no resolvable session: `guest` / `Guest User`.
    pub fn guest(peer_id: PeerId, room_id: &str, session: Option<String>) -> Self {
        Self {
            peer_id,
            username: "guest".to_string(),
            name: "Guest User".to_string(),
            session,
            room_id: room_id.to_string(),
        }
    }
}

/// Announcement of a file, sent before its chunks and stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_id: FileId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub extension: String,
    /// Total size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub realtime: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
}

impl FileMeta {
    /// Name of the content blob for this file: `<fileId>.<extension>`,
    /// or just the id when there is no extension.
    pub fn blob_name(&self) -> String {
        blob_name(&self.file_id, &self.extension)
    }
}

pub fn blob_name(file_id: &str, extension: &str) -> String {
    if extension.is_empty() {
        file_id.to_string()
    } else {
        format!("{}.{}", file_id, extension)
    }
}

/// One slice of a file. `data` is base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: FileId,
    #[serde(default)]
    pub extension: String,
    pub offset: u64,
    #[serde(default)]
    pub chunk_size: u64,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
}

impl FileChunk {
    pub fn new(file_id: &str, extension: &str, offset: u64, bytes: &[u8]) -> Self {
        Self {
            file_id: file_id.to_string(),
            extension: extension.to_string(),
            offset,
            chunk_size: bytes.len() as u64,
            data: B64.encode(bytes),
            from: None,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        B64.decode(&self.data)
    }
}

/// Body of `fileComplete`, `fileRequest` and `fileUpdate` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
}

/// Why a stored file could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileErrorReason {
    MetaNotFound,
    NotAvailableYet,
    FileMissingOrEmpty,
    OpenFailed,
}

impl FileErrorReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::MetaNotFound => "meta not found",
            Self::NotAvailableYet => "file not available yet",
            Self::FileMissingOrEmpty => "file not found or empty",
            Self::OpenFailed => "failed to open file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub reason: FileErrorReason,
    pub message: String,
    pub file_id: FileId,
}

/// Body of a `chat` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatText {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    #[serde(default)]
    pub room_id: Option<String>,
}

/// A stored chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub parent_id: Option<String>,
    pub room_id: String,
    pub participant_id: Option<PeerId>,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A stored stream-control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub id: String,
    pub room_id: String,
    pub participant_id: Option<PeerId>,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}
