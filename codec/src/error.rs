use thiserror::Error;

/// Failures that can occur while encoding or decoding a [`crate::Packet`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame exceeds the maximum inbound message size of {limit} bytes (got {actual})")]
    ProtocolOverflow { limit: usize, actual: usize },

    #[error("binary encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("structured body encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
