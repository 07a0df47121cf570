//! Server bootstrap: owns the listening socket, picks a concurrency
//! model, and shares one registry/engine pair across all connections.

use crate::audit::AuditLog;
use crate::blocking;
use crate::config::{ServerConfig, ServerMode};
use crate::engine::ProtocolEngine;
use crate::error::ServerError;
use crate::reactor::Reactor;
use crate::registry::ConnectionRegistry;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// A bound, not-yet-serving stompd server.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    engine: Arc<ProtocolEngine>,
}

impl Server {
    /// Binds the listening socket and constructs the shared engine.
    pub fn bind(config: ServerConfig, audit: Arc<dyn AuditLog>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)?;
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(ProtocolEngine::new(registry, audit));
        Ok(Self {
            listener,
            config,
            engine,
        })
    }

    /// The actually-bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Serves connections until a fatal listener/selector error. Both
    /// models produce identical observable protocol behavior.
    pub fn serve(self) -> Result<(), ServerError> {
        tracing::info!(
            "listening on {} ({} mode)",
            self.listener.local_addr()?,
            self.config.mode
        );
        match self.config.mode {
            ServerMode::ThreadPerConnection => blocking::serve(self.listener, self.engine),
            ServerMode::Reactor => Reactor::new(
                self.listener,
                self.engine,
                self.config.worker_threads,
                self.config.read_buffer_size,
            )?
            .run(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditLog;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn start_server(mode: ServerMode) -> SocketAddr {
        let config = ServerConfig::new(0, mode)
            .with_bind_addr("127.0.0.1:0".parse().unwrap())
            .with_worker_threads(2);
        let server = Server::bind(config, Arc::new(NoopAuditLog)).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            let _ = server.serve();
        });
        addr
    }

    struct TestClient {
        stream: TcpStream,
    }

    impl TestClient {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            Self { stream }
        }

        fn send(&mut self, frame_text: &str) {
            self.stream.write_all(frame_text.as_bytes()).unwrap();
            self.stream.write_all(&[0]).unwrap();
        }

        /// Reads one null-terminated frame. Panics on timeout.
        fn read_frame(&mut self) -> String {
            let mut frame = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = self.stream.read(&mut byte).unwrap();
                assert!(n > 0, "connection closed mid-frame");
                if byte[0] == 0 {
                    return String::from_utf8(frame).unwrap();
                }
                frame.push(byte[0]);
            }
        }

        /// Reads everything up to EOF.
        fn read_to_end(&mut self) -> Vec<u8> {
            let mut all = Vec::new();
            self.stream.read_to_end(&mut all).unwrap();
            all
        }

        fn expect_eof(&mut self) {
            let mut byte = [0u8; 1];
            assert_eq!(self.stream.read(&mut byte).unwrap(), 0);
        }
    }

    fn run_session(addr: SocketAddr, mode_label: &str) {
        let mut client = TestClient::connect(addr);

        client.send("CONNECT\nlogin:alice\npasscode:pw\n\n");
        assert_eq!(
            client.read_frame(),
            "CONNECTED\nversion:1.2\n\n",
            "{mode_label}: CONNECT"
        );

        client.send("SUBSCRIBE\ndestination:/rooms/1\nid:5\nreceipt:1\n\n");
        assert_eq!(client.read_frame(), "RECEIPT\nreceipt-id:1\n\n");

        client.send("SEND\ndestination:/rooms/1\n\nhi");
        assert_eq!(
            client.read_frame(),
            "MESSAGE\nsubscription:5\nmessage-id:0\ndestination:/rooms/1\n\nhi"
        );

        client.send("DISCONNECT\nreceipt:77\n\n");
        assert_eq!(client.read_frame(), "RECEIPT\nreceipt-id:77\n\n");
        client.expect_eof();
    }

    #[test]
    fn test_tpc_end_to_end() {
        let addr = start_server(ServerMode::ThreadPerConnection);
        run_session(addr, "tpc");
    }

    #[test]
    fn test_reactor_end_to_end() {
        let addr = start_server(ServerMode::Reactor);
        run_session(addr, "reactor");
    }

    /// The same pipelined script must yield byte-identical responses
    /// from both concurrency models.
    #[test]
    fn test_model_equivalence() {
        let script = [
            "CONNECT\nlogin:eve\npasscode:pw\n\n",
            "SUBSCRIBE\ndestination:/rooms/1\nid:5\nreceipt:1\n\n",
            "SEND\ndestination:/rooms/1\nreceipt:2\n\nhi",
            "SUBSCRIBE\ndestination:/rooms/1\nid:8\nreceipt:3\n\n",
            "SEND\ndestination:/rooms/1\nreceipt:4\n\nagain",
            "UNSUBSCRIBE\nid:8\nreceipt:5\n\n",
            "SEND\ndestination:/rooms/1\n\nrejected",
        ];

        let transcript = |mode: ServerMode| -> Vec<u8> {
            let addr = start_server(mode);
            let mut client = TestClient::connect(addr);
            for frame_text in script {
                client.send(frame_text);
            }
            client.read_to_end()
        };

        let tpc = transcript(ServerMode::ThreadPerConnection);
        let reactor = transcript(ServerMode::Reactor);
        assert!(!tpc.is_empty());
        assert_eq!(tpc, reactor);

        // Spot-check the shared transcript shape.
        let text = String::from_utf8(tpc).unwrap();
        let frames: Vec<&str> = text.split('\0').filter(|s| !s.is_empty()).collect();
        assert_eq!(frames[0], "CONNECTED\nversion:1.2\n\n");
        assert_eq!(
            frames[2],
            "MESSAGE\nsubscription:5\nmessage-id:0\ndestination:/rooms/1\n\nhi"
        );
        assert_eq!(
            frames[4],
            "MESSAGE\nsubscription:8\nmessage-id:1\ndestination:/rooms/1\n\nagain"
        );
        assert!(frames.last().unwrap().starts_with(
            "ERROR\nmessage:Cannot send to channel you are not subscribed to"
        ));
    }

    #[test]
    fn test_fanout_between_connections() {
        for mode in [ServerMode::ThreadPerConnection, ServerMode::Reactor] {
            let addr = start_server(mode);

            let mut alice = TestClient::connect(addr);
            alice.send("CONNECT\nlogin:alice\npasscode:pw\n\n");
            alice.read_frame();
            alice.send("SUBSCRIBE\ndestination:/rooms/1\nid:5\nreceipt:1\n\n");
            alice.read_frame();

            let mut bob = TestClient::connect(addr);
            bob.send("CONNECT\nlogin:bob\npasscode:pw\n\n");
            bob.read_frame();
            bob.send("SUBSCRIBE\ndestination:/rooms/1\nid:42\nreceipt:1\n\n");
            bob.read_frame();

            bob.send("SEND\ndestination:/rooms/1\n\nhello");

            // Each subscriber sees its OWN subscription id.
            assert_eq!(
                alice.read_frame(),
                "MESSAGE\nsubscription:5\nmessage-id:0\ndestination:/rooms/1\n\nhello"
            );
            assert_eq!(
                bob.read_frame(),
                "MESSAGE\nsubscription:42\nmessage-id:0\ndestination:/rooms/1\n\nhello"
            );
        }
    }

    #[test]
    fn test_violation_closes_connection() {
        for mode in [ServerMode::ThreadPerConnection, ServerMode::Reactor] {
            let addr = start_server(mode);
            let mut client = TestClient::connect(addr);
            client.send("NONSENSE\n\n");
            assert_eq!(
                client.read_frame(),
                "ERROR\nmessage:Unknown command: NONSENSE\n\n"
            );
            client.expect_eof();
        }
    }

    #[test]
    fn test_reactor_large_body_survives_partial_writes() {
        let addr = start_server(ServerMode::Reactor);
        let mut client = TestClient::connect(addr);
        client.send("CONNECT\nlogin:bulk\npasscode:pw\n\n");
        client.read_frame();
        client.send("SUBSCRIBE\ndestination:/bulk\nid:1\nreceipt:1\n\n");
        client.read_frame();

        let body = "x".repeat(256 * 1024);
        client.send(&format!("SEND\ndestination:/bulk\n\n{body}"));
        let frame = client.read_frame();
        assert!(frame.ends_with(&body));
        assert!(frame.starts_with("MESSAGE\nsubscription:1\nmessage-id:0\ndestination:/bulk\n\n"));
    }

    #[test]
    fn test_duplicate_login_rejected_across_connections() {
        let addr = start_server(ServerMode::ThreadPerConnection);

        let mut first = TestClient::connect(addr);
        first.send("CONNECT\nlogin:carol\npasscode:pw\n\n");
        first.read_frame();

        let mut second = TestClient::connect(addr);
        second.send("CONNECT\nlogin:carol\npasscode:pw\n\n");
        assert_eq!(
            second.read_frame(),
            "ERROR\nmessage:User already logged in\n\n"
        );
        second.expect_eof();

        // After the first client disconnects, carol is free again.
        first.send("DISCONNECT\nreceipt:9\n\n");
        first.read_frame();
        first.expect_eof();

        let mut third = TestClient::connect(addr);
        third.send("CONNECT\nlogin:carol\npasscode:pw\n\n");
        assert_eq!(third.read_frame(), "CONNECTED\nversion:1.2\n\n");
    }
}
