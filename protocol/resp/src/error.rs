use std::fmt;

/// Errors returned when the reply stream is structurally invalid.
///
/// An incomplete trailing frame is not an error; `split` reports it through
/// the interrupt offset instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame began with a byte that is not a RESP type marker.
    UnknownType(u8),
    /// An integer field (bulk length, array length) was malformed.
    InvalidInteger(String),
    /// Structurally invalid frame.
    Protocol(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnknownType(b) => write!(f, "unknown frame type byte 0x{b:02x}"),
            FrameError::InvalidInteger(msg) => write!(f, "invalid integer: {msg}"),
            FrameError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}
