use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,

    #[error("invalid string encoding")]
    InvalidEncoding,

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
