//! Server error types.

use thiserror::Error;

/// Server errors.
///
/// Protocol violations never appear here: they are answered with ERROR
/// frames and end only the offending session. These are the failures
/// that end a transport or prevent the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] stompd_protocol::ProtocolError),
}
