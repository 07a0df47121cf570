//! STOMP text frame model.
//!
//! Wire layout, terminated by a single null byte:
//!
//! ```text
//! COMMAND\n
//! header-name:header-value\n
//! ...\n
//! \n
//! body (verbatim, may contain newlines)
//! ```

use crate::error::ProtocolError;
use crate::{FRAME_TERMINATOR, STOMP_VERSION};
use bytes::{BufMut, BytesMut};

/// The closed set of commands this protocol speaks.
///
/// Anything a client sends outside this set is not representable here;
/// it surfaces as an "Unknown command" protocol violation in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client -> server
    Connect,
    Subscribe,
    Send,
    Unsubscribe,
    Disconnect,
    // Server -> client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Parses a command token. Returns `None` for anything outside the set.
    pub fn parse(token: &str) -> Option<Command> {
        match token {
            "CONNECT" => Some(Command::Connect),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "SEND" => Some(Command::Send),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "DISCONNECT" => Some(Command::Disconnect),
            "CONNECTED" => Some(Command::Connected),
            "MESSAGE" => Some(Command::Message),
            "RECEIPT" => Some(Command::Receipt),
            "ERROR" => Some(Command::Error),
            _ => None,
        }
    }

    /// The wire token for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Subscribe => "SUBSCRIBE",
            Command::Send => "SEND",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed STOMP frame.
///
/// Headers preserve insertion order so encoding is deterministic; lookup
/// by name returns the LAST occurrence, matching the duplicate-header
/// rule (last one wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Frame {
    /// Creates an empty frame for a known command.
    pub fn new(command: Command) -> Self {
        Self {
            command: command.as_str().to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header. Does not replace earlier occurrences; lookups
    /// already resolve to the last one.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// The raw command token.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Looks up a header by name, last occurrence winning.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All headers in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The frame body, verbatim.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// A `CONNECTED` reply carrying the protocol version.
    pub fn connected() -> Self {
        Frame::new(Command::Connected).with_header("version", STOMP_VERSION)
    }

    /// A `RECEIPT` acknowledging the client-supplied receipt id.
    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    /// A `MESSAGE` frame personalized for one subscriber.
    ///
    /// `destination` is the wire form, with its leading path separator.
    pub fn message(subscription_id: u64, message_id: u64, destination: &str, body: &str) -> Self {
        Frame::new(Command::Message)
            .with_header("subscription", subscription_id.to_string())
            .with_header("message-id", message_id.to_string())
            .with_header("destination", destination)
            .with_body(body)
    }

    /// An `ERROR` frame. The receipt id is echoed when the offending
    /// frame asked for a receipt.
    pub fn error(message: &str, receipt_id: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Error).with_header("message", message);
        if let Some(receipt_id) = receipt_id {
            frame = frame.with_header("receipt-id", receipt_id);
        }
        frame
    }

    /// Encodes the frame to its wire form, terminator included.
    pub fn encode(&self) -> BytesMut {
        let mut size = self.command.len() + 2 + self.body.len() + 1;
        for (name, value) in &self.headers {
            size += name.len() + value.len() + 2;
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(self.command.as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(value.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(self.body.as_bytes());
        buf.put_u8(FRAME_TERMINATOR);
        buf
    }

    /// Parses one frame's text (terminator already stripped).
    ///
    /// Parsing is permissive: the command token is trimmed, header lines
    /// split on the first `:` with both sides trimmed, lines without a
    /// `:` are ignored, and the body is everything after the first empty
    /// line, byte-for-byte.
    pub fn parse(text: &str) -> Frame {
        let (first, mut rest) = match text.split_once('\n') {
            Some((first, rest)) => (first, rest),
            None => (text, ""),
        };
        let command = first.trim().to_string();

        let mut headers = Vec::new();
        let mut body = "";
        loop {
            match rest.split_once('\n') {
                Some((line, remainder)) => {
                    if line.trim().is_empty() {
                        body = remainder;
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        headers.push((name.trim().to_string(), value.trim().to_string()));
                    }
                    rest = remainder;
                }
                None => {
                    // No empty line: header section runs to the end, no body.
                    if let Some((name, value)) = rest.split_once(':') {
                        headers.push((name.trim().to_string(), value.trim().to_string()));
                    }
                    break;
                }
            }
        }

        Frame {
            command,
            headers,
            body: body.to_string(),
        }
    }

    /// Decodes the next frame from `buf`.
    ///
    /// Returns `Ok(Some(frame))` when a terminator has been seen,
    /// `Ok(None)` if more bytes are needed. Bytes after the terminator
    /// are left in `buf` for the next frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let pos = match buf.iter().position(|&b| b == FRAME_TERMINATOR) {
            Some(pos) => pos,
            None => {
                if buf.len() > crate::MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: buf.len(),
                        max: crate::MAX_FRAME_SIZE,
                    });
                }
                return Ok(None);
            }
        };

        let raw = buf.split_to(pos + 1);
        let text =
            std::str::from_utf8(&raw[..pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Some(Frame::parse(text)))
    }
}
