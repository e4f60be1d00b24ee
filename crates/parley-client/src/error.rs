use parley_types::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client has stopped")]
    Stopped,

    #[error("connection to {0} is closed")]
    LinkClosed(PeerId),
}

/// Why a received file could not be put back together.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileAssemblyError {
    #[error("no meta received for file {0}")]
    UnknownFile(String),

    #[error("chunk at {offset} overlaps bytes already received up to {end}")]
    Overlap { offset: u64, end: u64 },

    #[error("missing bytes at offset {0}")]
    Gap(u64),

    #[error("chunk at offset {offset} runs past the end of any file")]
    OutOfRange { offset: u64 },

    #[error("assembled {got} bytes, meta announced {expected}")]
    SizeMismatch { got: u64, expected: u64 },

    #[error("chunk data is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}
