//! # stompd-protocol
//!
//! Wire protocol implementation for stompd.
//!
//! This crate provides:
//! - The STOMP text frame model (command, headers, body)
//! - A streaming encoder/decoder tolerant of arbitrary read fragmentation
//! - Protocol constants and error types

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Command, Frame};

/// STOMP protocol version advertised in CONNECTED frames.
pub const STOMP_VERSION: &str = "1.2";

/// Every frame on the wire ends with a single null byte.
pub const FRAME_TERMINATOR: u8 = 0;

/// Maximum accepted frame size (1 MiB). A connection that accumulates
/// more than this without a terminator is considered broken.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
