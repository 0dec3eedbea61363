//! Server-side error type.

use thiserror::Error;
use tracker_core::{TrackerError, ValidationError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid batch: {0}")]
    Validation(#[from] ValidationError),

    #[error("tracking failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
