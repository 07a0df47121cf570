//! Thread-per-connection transport: one dedicated OS thread per socket,
//! blocking one-byte reads feeding the codec, synchronous engine
//! invocation on the same thread. A slow consumer only delays further
//! reads on its own connection.

use crate::engine::ProtocolEngine;
use crate::error::ServerError;
use crate::registry::ConnectionHandle;
use crate::session::Session;
use parking_lot::Mutex;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use stompd_protocol::{Decoder, Frame};

/// Send side of a blocking connection.
///
/// Writes are serialized by the mutex so frames originating from the
/// connection's own thread and frames pushed by other connections'
/// broadcasts never interleave mid-frame.
pub struct BlockingHandle {
    /// Kept outside the writer lock so `close` can shut the socket down
    /// even while a write is in flight.
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    connected: AtomicBool,
}

impl BlockingHandle {
    fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            stream: stream.try_clone()?,
            writer: Mutex::new(stream.try_clone()?),
            connected: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl ConnectionHandle for BlockingHandle {
    fn send(&self, frame: &Frame) -> bool {
        if !self.is_connected() {
            return false;
        }
        let encoded = frame.encode();
        let mut writer = self.writer.lock();
        match writer.write_all(&encoded).and_then(|()| writer.flush()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("write failed: {e}");
                self.connected.store(false, Ordering::Release);
                false
            }
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Drives one connection to completion on the calling thread.
pub struct BlockingConnectionHandler {
    engine: Arc<ProtocolEngine>,
    stream: TcpStream,
}

impl BlockingConnectionHandler {
    pub fn new(engine: Arc<ProtocolEngine>, stream: TcpStream) -> Self {
        Self { engine, stream }
    }

    /// Registers with the registry, then loops: read one byte, feed the
    /// codec, run the engine on each completed frame. Ends on terminal
    /// state, EOF, transport error, or external close.
    pub fn run(self) {
        let Self { engine, stream } = self;
        let registry = engine.registry();
        let connection_id = registry.register();
        match stream.peer_addr() {
            Ok(peer) => tracing::info!(connection = connection_id, %peer, "client connected"),
            Err(_) => tracing::info!(connection = connection_id, "client connected"),
        }

        let handle = match BlockingHandle::new(&stream) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                tracing::warn!(connection = connection_id, "failed to clone stream: {e}");
                registry.disconnect(connection_id);
                return;
            }
        };
        registry.set_handle(connection_id, handle.clone());

        let mut session = Session::new(connection_id);
        let mut decoder = Decoder::new();
        let mut reader = BufReader::new(stream);
        let mut byte = [0u8; 1];

        while !session.is_terminated() && handle.is_connected() {
            match reader.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => match decoder.push_byte(byte[0]) {
                    Ok(Some(frame)) => engine.handle(&mut session, frame),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(connection = connection_id, "codec error: {e}");
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(connection = connection_id, "read error: {e}");
                    break;
                }
            }
        }

        engine.connection_closed(&mut session);
        tracing::info!(connection = connection_id, "client disconnected");
    }
}

/// Accept loop for the thread-per-connection model.
pub fn serve(listener: TcpListener, engine: Arc<ProtocolEngine>) -> Result<(), ServerError> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let handler = BlockingConnectionHandler::new(engine.clone(), stream);
                if let Err(e) = thread::Builder::new()
                    .name("stompd-conn".to_string())
                    .spawn(move || handler.run())
                {
                    tracing::error!("failed to spawn connection thread: {e}");
                }
            }
            Err(e) => tracing::error!("accept error: {e}"),
        }
    }
}
