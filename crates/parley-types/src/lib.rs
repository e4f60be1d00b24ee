//! Shared wire and data types for the parley signaling relay and its clients.

pub mod frames;
pub mod ids;
pub mod models;

pub use frames::{DEFAULT_ROOM, Frame, FrameType};
pub use ids::{FileId, PeerId};
pub use models::{
    ChatEvent, ChatMessage, ChatText, ErrorFrame, FileChunk, FileErrorReason, FileMeta, FileRef,
    JoinRoom, PeerDetail,
};

/// Chunk size used by senders and as the fallback when re-streaming stored files.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024;

/// Largest chunk the relay will re-stream in a single frame.
pub const MAX_CHUNK_SIZE: u64 = 128 * 1024;
