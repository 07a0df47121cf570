//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while decoding frames off the wire.
///
/// These are transport-level failures: the byte stream itself is broken,
/// as opposed to a well-formed frame that violates protocol rules (which
/// the server answers with an ERROR frame).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame too large: {size} bytes without a terminator (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}
