use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::signaling::MemberId;

/// Errors surfaced by rooms and participants
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("negotiation with {member} timed out after {timeout:?}")]
    NegotiationTimeout { member: MemberId, timeout: Duration },

    #[error("invalid signaling event: {0}")]
    InvalidEvent(String),

    #[error("malformed signaling message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
