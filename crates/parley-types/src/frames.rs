use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::PeerId;
use crate::models::{ErrorFrame, FileErrorReason, PeerDetail};

/// Room used when a channel is opened without a `roomId`.
pub const DEFAULT_ROOM: &str = "default";

/// Frame types understood by the relay or the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Peers,
    NewPeer,
    PeerLeave,
    JoinRoom,
    Offer,
    Answer,
    Candidate,
    Chat,
    RequestChatHistory,
    ChatHistory,
    RequestChatEvent,
    ChatEvent,
    StreamUpdate,
    PromoteStream,
    DemoteStream,
    StopSharing,
    SetMainScreen,
    FileMeta,
    FileChunk,
    FileComplete,
    FileRequest,
    FileUpdate,
    Error,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peers => "peers",
            Self::NewPeer => "newPeer",
            Self::PeerLeave => "peerLeave",
            Self::JoinRoom => "joinRoom",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Chat => "chat",
            Self::RequestChatHistory => "requestChatHistory",
            Self::ChatHistory => "chatHistory",
            Self::RequestChatEvent => "requestChatEvent",
            Self::ChatEvent => "chatEvent",
            Self::StreamUpdate => "streamUpdate",
            Self::PromoteStream => "promoteStream",
            Self::DemoteStream => "demoteStream",
            Self::StopSharing => "stopSharing",
            Self::SetMainScreen => "setMainScreen",
            Self::FileMeta => "fileMeta",
            Self::FileChunk => "fileChunk",
            Self::FileComplete => "fileComplete",
            Self::FileRequest => "fileRequest",
            Self::FileUpdate => "fileUpdate",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "peers" => Self::Peers,
            "newPeer" => Self::NewPeer,
            "peerLeave" => Self::PeerLeave,
            "joinRoom" => Self::JoinRoom,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "candidate" => Self::Candidate,
            "chat" => Self::Chat,
            "requestChatHistory" => Self::RequestChatHistory,
            "chatHistory" => Self::ChatHistory,
            "requestChatEvent" => Self::RequestChatEvent,
            "chatEvent" => Self::ChatEvent,
            "streamUpdate" => Self::StreamUpdate,
            "promoteStream" => Self::PromoteStream,
            "demoteStream" => Self::DemoteStream,
            "stopSharing" => Self::StopSharing,
            "setMainScreen" => Self::SetMainScreen,
            "fileMeta" => Self::FileMeta,
            "fileChunk" => Self::FileChunk,
            "fileComplete" => Self::FileComplete,
            "fileRequest" => Self::FileRequest,
            "fileUpdate" => Self::FileUpdate,
            "error" => Self::Error,
            _ => return None,
        };
        Some(kind)
    }

    /// Frames appended to the per-room chat/file log.
    pub fn is_history(self) -> bool {
        matches!(self, Self::Chat | Self::FileMeta)
    }

    /// Frames appended to the per-room stream-control event log.
    pub fn is_stream_control(self) -> bool {
        matches!(
            self,
            Self::PromoteStream | Self::DemoteStream | Self::StopSharing | Self::StreamUpdate
        )
    }
}

/// A message frame as it travels over the channel.
///
/// Only `type`, `to` and `from` are interpreted generically. All other
/// fields are kept in `body` untouched, so frames the relay does not
/// understand are forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Frame {
    pub fn new(kind: FrameType) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            to: None,
            from: None,
            body: Map::new(),
        }
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Build a frame of `kind` whose body is the serialized `payload`.
    pub fn encode<T: Serialize>(kind: FrameType, payload: &T) -> serde_json::Result<Self> {
        let mut frame: Frame = serde_json::from_value(serde_json::to_value(payload)?)?;
        frame.kind = kind.as_str().to_string();
        Ok(frame)
    }

    /// Decode the whole frame (including `type`/`from`) into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::parse(&self.kind)
    }

    pub fn is(&self, kind: FrameType) -> bool {
        self.kind == kind.as_str()
    }

    /// Direct-message target, ignoring empty strings.
    pub fn target(&self) -> Option<&PeerId> {
        self.to.as_ref().filter(|id| !id.is_empty())
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn to_peer(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn from_peer(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    // -- Relay -> client frames --

    /// Membership snapshot sent to a peer when it joins a room.
    pub fn peers(my_id: &PeerId, others: &[PeerDetail]) -> Self {
        let ids: Vec<&PeerId> = others.iter().map(|p| &p.peer_id).collect();
        let details: Map<String, Value> = others
            .iter()
            .map(|p| {
                (
                    p.peer_id.to_string(),
                    serde_json::to_value(p).unwrap_or(Value::Null),
                )
            })
            .collect();
        Self::new(FrameType::Peers)
            .with("myId", my_id)
            .with("peers", ids)
            .with("peerDetails", details)
    }

    pub fn new_peer(detail: &PeerDetail) -> Self {
        Self::new(FrameType::NewPeer)
            .with("peerId", &detail.peer_id)
            .with("peerDetail", detail)
    }

    pub fn peer_leave(peer_id: &PeerId) -> Self {
        Self::new(FrameType::PeerLeave).with("peerId", peer_id)
    }

    pub fn chat_history(entries: Vec<Frame>) -> Self {
        Self::new(FrameType::ChatHistory).with("chatHistory", entries)
    }

    pub fn chat_event(entries: Vec<Frame>) -> Self {
        Self::new(FrameType::ChatEvent).with("chatEvent", entries)
    }

    pub fn file_error(reason: FileErrorReason, file_id: &str) -> Self {
        let payload = ErrorFrame {
            reason,
            message: reason.message().to_string(),
            file_id: file_id.to_string(),
        };
        Self::encode(FrameType::Error, &payload).unwrap_or_else(|_| Self::new(FrameType::Error))
    }
}
