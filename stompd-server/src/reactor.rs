//! Readiness-driven connection multiplexer.
//!
//! One selection thread runs a `mio` poll loop over the listener and
//! all live sockets; a fixed worker pool executes protocol processing
//! so application-level latency never stalls the selection loop.
//!
//! Ordering invariant: frames from a single connection are processed in
//! arrival order. The per-connection mailbox admits at most one
//! in-flight engine invocation at a time; the finishing worker chains
//! the next queued frame. Distinct connections process fully in
//! parallel.

use crate::engine::ProtocolEngine;
use crate::error::ServerError;
use crate::pool::WorkerPool;
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::session::Session;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stompd_protocol::{Decoder, Frame};

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);
const TOKEN_BASE: usize = 2;

/// Send side of a reactor connection.
///
/// Sends append encoded bytes to the pending-outbound buffer and wake
/// the poll thread, which drains the buffer as the OS accepts writes.
struct ReactorHandle {
    outbound: Mutex<BytesMut>,
    waker: Arc<Waker>,
    open: AtomicBool,
}

impl ReactorHandle {
    fn new(waker: Arc<Waker>) -> Self {
        Self {
            outbound: Mutex::new(BytesMut::new()),
            waker,
            open: AtomicBool::new(true),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl ConnectionHandle for ReactorHandle {
    fn send(&self, frame: &Frame) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.lock().extend_from_slice(&frame.encode());
        let _ = self.waker.wake();
        true
    }

    /// Marks the connection for teardown. The poll thread flushes what
    /// is already buffered, then closes the socket.
    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Frames awaiting engine processing for one connection.
struct Mailbox {
    queue: VecDeque<Frame>,
    in_flight: bool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: false,
        }
    }
}

struct Connection {
    stream: TcpStream,
    token: Token,
    connection_id: ConnectionId,
    handle: Arc<ReactorHandle>,
    decoder: Decoder,
    session: Arc<Mutex<Session>>,
    mailbox: Arc<Mutex<Mailbox>>,
    interest: Interest,
}

impl Connection {
    /// Writes pending outbound bytes without blocking. Returns whether
    /// the buffer fully drained.
    fn flush_outbound(&mut self) -> io::Result<bool> {
        let mut outbound = self.handle.outbound.lock();
        while !outbound.is_empty() {
            match self.stream.write(&outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// The selection loop plus its worker pool.
pub struct Reactor {
    listener: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    engine: Arc<ProtocolEngine>,
    pool: WorkerPool,
    connections: Slab<Connection>,
    read_buffer_size: usize,
}

impl Reactor {
    /// Wraps an already-bound listener.
    pub fn new(
        listener: std::net::TcpListener,
        engine: Arc<ProtocolEngine>,
        worker_threads: usize,
        read_buffer_size: usize,
    ) -> Result<Self, ServerError> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let pool = WorkerPool::new(worker_threads)?;
        Ok(Self {
            listener,
            poll,
            waker,
            engine,
            pool,
            connections: Slab::new(),
            read_buffer_size,
        })
    }

    /// Runs the selection loop. Returns only on a poll failure.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKE => self.drain_wakeups(),
                    token => self.connection_ready(token, event.is_readable()),
                }
            }
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let connection_id = self.engine.registry().register();
                    let entry = self.connections.vacant_entry();
                    let token = Token(TOKEN_BASE + entry.key());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!("failed to register connection: {e}");
                        self.engine.registry().disconnect(connection_id);
                        continue;
                    }
                    let handle = Arc::new(ReactorHandle::new(self.waker.clone()));
                    self.engine
                        .registry()
                        .set_handle(connection_id, handle.clone());
                    tracing::info!(connection = connection_id, %peer, "client connected");
                    entry.insert(Connection {
                        stream,
                        token,
                        connection_id,
                        handle,
                        decoder: Decoder::new(),
                        session: Arc::new(Mutex::new(Session::new(connection_id))),
                        mailbox: Arc::new(Mutex::new(Mailbox::new())),
                        interest: Interest::READABLE,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::error!("accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Wakeups signal new outbound bytes or close requests from worker
    /// threads; sweep every connection for pending work.
    fn drain_wakeups(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.flush_and_sweep(key);
        }
    }

    fn connection_ready(&mut self, token: Token, readable: bool) {
        let key = match token.0.checked_sub(TOKEN_BASE) {
            Some(key) => key,
            None => return,
        };
        if !self.connections.contains(key) {
            return;
        }

        if readable {
            match self.read_ready(key) {
                Ok(false) => {}
                Ok(true) => {
                    // Peer closed.
                    self.teardown(key);
                    return;
                }
                Err(e) => {
                    tracing::debug!("connection error: {e}");
                    self.teardown(key);
                    return;
                }
            }
        }
        // Writable readiness and post-read responses both land here.
        self.flush_and_sweep(key);
    }

    /// Drains currently-available bytes into the connection's codec and
    /// hands completed frames to the worker pool. `Ok(true)` means the
    /// peer closed the stream.
    fn read_ready(&mut self, key: usize) -> Result<bool, ServerError> {
        let mut chunk = vec![0u8; self.read_buffer_size];
        let conn = &mut self.connections[key];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    conn.decoder.extend(&chunk[..n]);
                    loop {
                        match conn.decoder.decode_frame() {
                            Ok(Some(frame)) => Self::dispatch(&self.engine, &self.pool, conn, frame),
                            Ok(None) => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queues a frame for the connection and starts a worker chain if
    /// none is in flight.
    fn dispatch(engine: &Arc<ProtocolEngine>, pool: &WorkerPool, conn: &Connection, frame: Frame) {
        {
            let mut mailbox = conn.mailbox.lock();
            mailbox.queue.push_back(frame);
            if mailbox.in_flight {
                return;
            }
            mailbox.in_flight = true;
        }

        let engine = engine.clone();
        let session = conn.session.clone();
        let mailbox = conn.mailbox.clone();
        let handle = conn.handle.clone();
        pool.execute(move || {
            loop {
                let frame = {
                    let mut mailbox = mailbox.lock();
                    match mailbox.queue.pop_front() {
                        Some(frame) => frame,
                        None => {
                            mailbox.in_flight = false;
                            break;
                        }
                    }
                };
                engine.handle(&mut session.lock(), frame);
            }
            if session.lock().is_terminated() {
                handle.close();
            }
        });
    }

    /// Flushes pending outbound bytes and completes close requests once
    /// their buffers drain.
    fn flush_and_sweep(&mut self, key: usize) {
        if !self.connections.contains(key) {
            return;
        }
        let conn = &mut self.connections[key];
        match conn.flush_outbound() {
            Ok(drained) => {
                if drained && !conn.handle.is_open() {
                    self.teardown(key);
                    return;
                }
                let desired = if drained {
                    Interest::READABLE
                } else {
                    Interest::READABLE.add(Interest::WRITABLE)
                };
                if conn.interest != desired {
                    if let Err(e) =
                        self.poll
                            .registry()
                            .reregister(&mut conn.stream, conn.token, desired)
                    {
                        tracing::warn!("failed to update interest: {e}");
                        self.teardown(key);
                        return;
                    }
                    conn.interest = desired;
                }
            }
            Err(e) => {
                tracing::debug!("write error: {e}");
                self.teardown(key);
            }
        }
    }

    /// Deregisters from the selector and releases registry state.
    fn teardown(&mut self, key: usize) {
        if !self.connections.contains(key) {
            return;
        }
        let mut conn = self.connections.remove(key);
        conn.handle.close();
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.engine.connection_closed(&mut conn.session.lock());
        tracing::info!(connection = conn.connection_id, "client disconnected");
    }
}
