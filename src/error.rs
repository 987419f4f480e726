//! Crate-wide error type.
//!
//! Every fallible public function returns `Result<T, StrandError>`. Errors
//! that arise while handling one accepted TCP connection or one UDP datagram
//! are caught at that boundary and serialized back to the caller as
//! `{"error": "..."}`; they never unwind into the loop that spawned the
//! handling task.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrandError>;

#[derive(Debug, Error)]
pub enum StrandError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("no room for more peers")]
    NoRoom,

    #[error("admission queue full")]
    QueueFull,

    #[error("codec error: {0}")]
    Codec(String),
}

impl StrandError {
    /// Render as the `{"error": "..."}` envelope the wire contract expects.
    pub fn to_json_reply(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}
