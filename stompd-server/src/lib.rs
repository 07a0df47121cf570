//! # stompd-server
//!
//! TCP server for stompd.
//!
//! This crate provides:
//! - The concurrent connection/subscription registry
//! - The protocol engine (per-connection STOMP state machine)
//! - Two interchangeable concurrency models: thread-per-connection and
//!   a mio-based reactor with a worker pool
//! - The fire-and-forget durable-logging collaborator client

pub mod audit;
pub mod blocking;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ServerConfig, ServerMode};
pub use engine::ProtocolEngine;
pub use error::ServerError;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use server::Server;
pub use session::Session;
