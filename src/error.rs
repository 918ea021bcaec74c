use std::io;

use thiserror::Error;

use crate::common::PeerId;

/// Errors produced by the length-prefixed frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: String, reason: String },

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(err))
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
