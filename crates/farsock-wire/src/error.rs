use crate::codec::MAX_FRAME_SIZE;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,

    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),

    #[error("unknown message type: {0}")]
    UnknownType(u32),

    #[error("unknown codec id: {0}")]
    UnknownCodec(u32),

    #[error("version mismatch: got {got:#010x}, expected {expected:#010x}")]
    VersionMismatch { got: u32, expected: u32 },

    #[error("content does not match envelope (type {type_id}, response={is_response})")]
    ContentMismatch { type_id: u32, is_response: bool },

    #[error("invalid UTF-8 in string field")]
    InvalidString,

    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}
