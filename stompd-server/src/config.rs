//! Server configuration.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Which connection-multiplexing model the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// One OS thread per accepted socket, blocking reads.
    ThreadPerConnection,
    /// A readiness-notification loop plus a worker pool.
    Reactor,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::ThreadPerConnection => write!(f, "tpc"),
            ServerMode::Reactor => write!(f, "reactor"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Concurrency model.
    pub mode: ServerMode,
    /// Worker threads for reactor protocol execution.
    pub worker_threads: usize,
    /// Read chunk size for the reactor's drain loop.
    pub read_buffer_size: usize,
    /// Durable-logging sink address.
    pub audit_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 61613)),
            mode: ServerMode::ThreadPerConnection,
            worker_threads: num_cpus::get(),
            read_buffer_size: 4096,
            audit_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 7778)),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, mode: ServerMode) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            mode,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn with_audit_addr(mut self, audit_addr: SocketAddr) -> Self {
        self.audit_addr = audit_addr;
        self
    }
}
