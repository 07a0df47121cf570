//! Protocol engine: the per-frame state machine shared by both
//! concurrency models.
//!
//! One `ProtocolEngine` instance holds all process-wide mutable state
//! (credential records, login sessions, the message-id counter) and is
//! shared `Arc`-style by every connection. Per-connection state lives in
//! a [`Session`]; both the blocking handler and the reactor are thin
//! drivers that feed `(session, frame)` pairs into [`ProtocolEngine::handle`].

use crate::audit::AuditLog;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stompd_protocol::{Command, Frame};
use thiserror::Error;

/// A protocol violation. The display text is exactly the `message`
/// header of the ERROR frame sent to the offending client.
#[derive(Debug, Error)]
pub enum Violation {
    #[error("Missing login or passcode")]
    MissingCredentials,

    #[error("User already logged in")]
    AlreadyLoggedIn,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Missing destination or id")]
    MissingSubscribeHeaders,

    #[error("Invalid subscription id: {0}")]
    InvalidSubscriptionId(String),

    #[error("Missing destination")]
    MissingDestination,

    #[error("Cannot send to channel you are not subscribed to")]
    NotSubscribed,

    #[error("Missing id")]
    MissingId,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Credential records and login sessions, guarded together so the
/// CONNECT check-then-register sequence is atomic.
struct Accounts {
    /// username -> passcode. Created on first successful CONNECT with
    /// an unseen username, immutable thereafter.
    credentials: HashMap<String, String>,
    /// username -> connection currently logged in under it.
    active: HashMap<String, ConnectionId>,
}

enum ConnectOutcome {
    Accepted { newly_registered: bool },
    Rejected(Violation),
}

/// The shared protocol state machine.
pub struct ProtocolEngine {
    registry: Arc<ConnectionRegistry>,
    accounts: Mutex<Accounts>,
    next_message_id: AtomicU64,
    audit: Arc<dyn AuditLog>,
}

impl ProtocolEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            registry,
            accounts: Mutex::new(Accounts {
                credentials: HashMap::new(),
                active: HashMap::new(),
            }),
            next_message_id: AtomicU64::new(0),
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Processes one frame for one connection.
    ///
    /// Every command is dispatched through the closed [`Command`] set;
    /// an unrecognized token is a first-class violation, not a
    /// fallthrough. Frames arriving after the session turned terminal
    /// are ignored.
    pub fn handle(&self, session: &mut Session, frame: Frame) {
        if session.is_terminated() {
            return;
        }

        match Command::parse(frame.command()) {
            Some(Command::Connect) => self.handle_connect(session, &frame),
            Some(Command::Subscribe) => self.handle_subscribe(session, &frame),
            Some(Command::Send) => self.handle_send(session, &frame),
            Some(Command::Unsubscribe) => self.handle_unsubscribe(session, &frame),
            Some(Command::Disconnect) => self.handle_disconnect(session, &frame),
            // Server-to-client commands coming FROM a client are just as
            // unknown as a garbage token.
            Some(Command::Connected | Command::Message | Command::Receipt | Command::Error)
            | None => self.fail(
                session,
                &Violation::UnknownCommand(frame.command().to_string()),
                frame.header("receipt"),
            ),
        }
    }

    /// Teardown hook for drivers: the transport died (peer close, I/O
    /// error, external close) without a DISCONNECT frame. Clears the
    /// login session so the username can log in again, and releases all
    /// registry state. Safe to call on already-terminated sessions.
    pub fn connection_closed(&self, session: &mut Session) {
        self.logout(session);
        self.registry.disconnect(session.id());
        session.terminate();
    }

    fn handle_connect(&self, session: &mut Session, frame: &Frame) {
        let (login, passcode) = match (frame.header("login"), frame.header("passcode")) {
            (Some(login), Some(passcode)) => (login.to_string(), passcode.to_string()),
            _ => return self.fail(session, &Violation::MissingCredentials, None),
        };

        let outcome = {
            let mut accounts = self.accounts.lock();
            if accounts.active.contains_key(&login) {
                ConnectOutcome::Rejected(Violation::AlreadyLoggedIn)
            } else {
                match accounts.credentials.get(&login) {
                    Some(stored) if *stored != passcode => {
                        ConnectOutcome::Rejected(Violation::WrongPassword)
                    }
                    Some(_) => {
                        accounts.active.insert(login.clone(), session.id());
                        ConnectOutcome::Accepted {
                            newly_registered: false,
                        }
                    }
                    None => {
                        accounts.credentials.insert(login.clone(), passcode.clone());
                        accounts.active.insert(login.clone(), session.id());
                        ConnectOutcome::Accepted {
                            newly_registered: true,
                        }
                    }
                }
            }
        };

        match outcome {
            ConnectOutcome::Rejected(violation) => self.fail(session, &violation, None),
            ConnectOutcome::Accepted { newly_registered } => {
                // A second successful CONNECT under a new username
                // releases the old login session.
                if let Some(previous) = session.replace_username(login.clone()) {
                    self.accounts.lock().active.remove(&previous);
                }
                if newly_registered {
                    self.audit.register_user(&login, &passcode);
                }
                self.audit.record_login(&login);
                tracing::info!(connection = session.id(), user = %login, "logged in");
                self.registry.send(session.id(), &Frame::connected());
            }
        }
    }

    fn handle_subscribe(&self, session: &mut Session, frame: &Frame) {
        let receipt = frame.header("receipt");
        let (destination, id) = match (frame.header("destination"), frame.header("id")) {
            (Some(destination), Some(id)) => (destination, id),
            _ => return self.fail(session, &Violation::MissingSubscribeHeaders, receipt),
        };

        let channel = strip_separator(destination);
        let subscription_id: u64 = match id.parse() {
            Ok(subscription_id) => subscription_id,
            Err(_) => {
                return self.fail(
                    session,
                    &Violation::InvalidSubscriptionId(id.to_string()),
                    receipt,
                )
            }
        };

        self.registry
            .subscribe(session.id(), channel, subscription_id);
        session.record_subscription(subscription_id, channel.to_string());
        tracing::debug!(connection = session.id(), %channel, subscription_id, "subscribed");
        if let Some(username) = session.username() {
            self.audit.record_subscription(username, channel);
        }

        if let Some(receipt) = receipt {
            self.registry.send(session.id(), &Frame::receipt(receipt));
        }
    }

    fn handle_send(&self, session: &mut Session, frame: &Frame) {
        let receipt = frame.header("receipt");
        let destination = match frame.header("destination") {
            Some(destination) => destination,
            None => return self.fail(session, &Violation::MissingDestination, receipt),
        };

        let channel = strip_separator(destination);
        if !self.registry.is_subscribed(session.id(), channel) {
            return self.fail(session, &Violation::NotSubscribed, receipt);
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let wire_destination = format!("/{channel}");
        // Each subscriber gets a MESSAGE stamped with its OWN
        // subscription id for the channel, not the sender's.
        for subscriber in self.registry.subscribers(channel) {
            let subscription_id = self.registry.subscription_id(subscriber, channel);
            self.registry.send(
                subscriber,
                &Frame::message(subscription_id, message_id, &wire_destination, frame.body()),
            );
        }
        tracing::debug!(connection = session.id(), %channel, message_id, "message fanned out");

        self.track_upload(session, channel, frame.body());

        if let Some(receipt) = receipt {
            self.registry.send(session.id(), &Frame::receipt(receipt));
        }
    }

    fn handle_unsubscribe(&self, session: &mut Session, frame: &Frame) {
        let receipt = frame.header("receipt");
        let id = match frame.header("id") {
            Some(id) => id,
            None => return self.fail(session, &Violation::MissingId, receipt),
        };
        let subscription_id: u64 = match id.parse() {
            Ok(subscription_id) => subscription_id,
            Err(_) => {
                return self.fail(
                    session,
                    &Violation::InvalidSubscriptionId(id.to_string()),
                    receipt,
                )
            }
        };

        // An id that was never subscribed is a no-op, but the receipt is
        // still honored.
        if let Some(channel) = session.remove_subscription(subscription_id) {
            self.registry.unsubscribe(session.id(), &channel);
            tracing::debug!(connection = session.id(), %channel, "unsubscribed");
            if let Some(username) = session.username() {
                self.audit.remove_subscription(username, &channel);
            }
        }

        if let Some(receipt) = receipt {
            self.registry.send(session.id(), &Frame::receipt(receipt));
        }
    }

    fn handle_disconnect(&self, session: &mut Session, frame: &Frame) {
        // The receipt goes out BEFORE teardown: the transport must still
        // be writable when it is sent.
        if let Some(receipt) = frame.header("receipt") {
            self.registry.send(session.id(), &Frame::receipt(receipt));
        }
        self.logout(session);
        self.registry.disconnect(session.id());
        session.terminate();
        tracing::info!(connection = session.id(), "disconnected");
    }

    /// Uniform failure policy: send ERROR, clear the login session, mark
    /// the session terminal. A single violation ends the session.
    fn fail(&self, session: &mut Session, violation: &Violation, receipt_id: Option<&str>) {
        tracing::debug!(connection = session.id(), %violation, "protocol violation");
        self.registry.send(
            session.id(),
            &Frame::error(&violation.to_string(), receipt_id),
        );
        if let Some(username) = session.take_username() {
            let mut accounts = self.accounts.lock();
            if accounts.active.get(&username) == Some(&session.id()) {
                accounts.active.remove(&username);
            }
        }
        session.terminate();
    }

    /// Clears the login session for a normal logout and records it with
    /// the audit sink.
    fn logout(&self, session: &mut Session) {
        if let Some(username) = session.take_username() {
            {
                let mut accounts = self.accounts.lock();
                if accounts.active.get(&username) == Some(&session.id()) {
                    accounts.active.remove(&username);
                }
            }
            self.audit.record_logout(&username);
            self.audit.remove_all_subscriptions(&username);
        }
    }

    /// Parses the `source file: <name>` convention out of a SEND body
    /// and reports the first upload of each (filename, channel) pair.
    fn track_upload(&self, session: &mut Session, channel: &str, body: &str) {
        let filename = body
            .lines()
            .find_map(|line| line.strip_prefix("source file: "))
            .map(str::trim)
            .unwrap_or("unknown");
        if session.record_upload(filename, channel) {
            if let Some(username) = session.username() {
                self.audit.record_file_upload(username, filename, channel);
            }
        }
    }
}

/// Destinations carry a leading path separator on the wire; channels
/// are stored without it.
fn strip_separator(destination: &str) -> &str {
    destination.strip_prefix('/').unwrap_or(destination)
}
