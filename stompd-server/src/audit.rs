//! Durable-logging collaborator client.
//!
//! The server reports user registrations, logins, logouts, channel
//! subscriptions, and file uploads to an external sink over a simple
//! request/response TCP line protocol: one SQL statement terminated by a
//! null byte, one response terminated by a null byte.
//!
//! The capability is injectable so tests can substitute a no-op or a
//! recording fake, and delivery is fire-and-forget on a background
//! thread: sink failures are logged locally and can never block or
//! alter protocol handling.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// The audit events the protocol engine reports.
pub trait AuditLog: Send + Sync {
    fn register_user(&self, username: &str, passcode: &str);
    fn record_login(&self, username: &str);
    fn record_logout(&self, username: &str);
    fn record_file_upload(&self, username: &str, filename: &str, channel: &str);
    fn record_subscription(&self, username: &str, channel: &str);
    fn remove_subscription(&self, username: &str, channel: &str);
    fn remove_all_subscriptions(&self, username: &str);
}

/// Audit sink that drops every event. Used in tests and when no sink is
/// configured.
pub struct NoopAuditLog;

impl AuditLog for NoopAuditLog {
    fn register_user(&self, _username: &str, _passcode: &str) {}
    fn record_login(&self, _username: &str) {}
    fn record_logout(&self, _username: &str) {}
    fn record_file_upload(&self, _username: &str, _filename: &str, _channel: &str) {}
    fn record_subscription(&self, _username: &str, _channel: &str) {}
    fn remove_subscription(&self, _username: &str, _channel: &str) {}
    fn remove_all_subscriptions(&self, _username: &str) {}
}

/// Fire-and-forget TCP client for the durable-logging service.
///
/// Statements are queued to a dedicated delivery thread; each one opens
/// a fresh connection, writes the statement plus terminator, and reads
/// the response up to its terminator.
pub struct TcpAuditLog {
    sender: Option<Sender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl TcpAuditLog {
    pub fn new(addr: SocketAddr) -> Self {
        let (sender, receiver) = unbounded::<String>();
        let worker = thread::Builder::new()
            .name("stompd-audit".to_string())
            .spawn(move || {
                for statement in receiver {
                    match execute(&addr, &statement) {
                        Ok(response) => {
                            tracing::trace!(%response, "audit statement delivered")
                        }
                        Err(e) => tracing::warn!("audit sink unreachable: {e}"),
                    }
                }
            })
            .ok();
        if worker.is_none() {
            tracing::warn!("failed to spawn audit delivery thread; audit disabled");
        }
        Self {
            sender: worker.is_some().then_some(sender),
            worker,
        }
    }

    fn submit(&self, statement: String) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(statement);
        }
    }
}

impl Drop for TcpAuditLog {
    fn drop(&mut self) {
        // Closing the channel lets the delivery thread drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl AuditLog for TcpAuditLog {
    fn register_user(&self, username: &str, passcode: &str) {
        self.submit(format!(
            "INSERT INTO users (username, password, registration_date) VALUES ('{}', '{}', '{}')",
            escape(username),
            escape(passcode),
            timestamp()
        ));
    }

    fn record_login(&self, username: &str) {
        self.submit(format!(
            "INSERT INTO login_history (username, login_time) VALUES ('{}', '{}')",
            escape(username),
            timestamp()
        ));
    }

    fn record_logout(&self, username: &str) {
        self.submit(format!(
            "UPDATE login_history SET logout_time = '{}' WHERE username = '{}' AND logout_time IS NULL",
            timestamp(),
            escape(username)
        ));
    }

    fn record_file_upload(&self, username: &str, filename: &str, channel: &str) {
        self.submit(format!(
            "INSERT INTO file_tracking (username, filename, upload_time, game_channel) VALUES ('{}', '{}', '{}', '{}')",
            escape(username),
            escape(filename),
            timestamp(),
            escape(channel)
        ));
    }

    fn record_subscription(&self, username: &str, channel: &str) {
        self.submit(format!(
            "INSERT INTO subscriptions (username, channel, subscribe_time) VALUES ('{}', '{}', '{}')",
            escape(username),
            escape(channel),
            timestamp()
        ));
    }

    fn remove_subscription(&self, username: &str, channel: &str) {
        self.submit(format!(
            "DELETE FROM subscriptions WHERE username = '{}' AND channel = '{}'",
            escape(username),
            escape(channel)
        ));
    }

    fn remove_all_subscriptions(&self, username: &str) {
        self.submit(format!(
            "DELETE FROM subscriptions WHERE username = '{}'",
            escape(username)
        ));
    }
}

/// One request/response exchange with the sink.
fn execute(addr: &SocketAddr, statement: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    stream.write_all(statement.as_bytes())?;
    stream.write_all(&[0])?;
    stream.flush()?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == 0 => break,
            Ok(_) => response.push(byte[0]),
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Doubles single quotes so a statement cannot escape its literal.
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
