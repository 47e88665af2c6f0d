//! Protocol error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid control byte: 0x{0:02x}")]
    InvalidControl(u8),

    #[error("frame has {got} parts, expected {expected}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("frame field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("job item is not valid JSON: {0}")]
    InvalidJob(#[from] serde_json::Error),

    #[error("job fingerprinting failed: {0}")]
    Fingerprint(String),

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
