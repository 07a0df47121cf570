//! stompd - STOMP-style publish/subscribe messaging server.

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use stompd_server::audit::TcpAuditLog;
use stompd_server::{Server, ServerConfig, ServerMode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stompd", version, about = "STOMP-style publish/subscribe messaging server")]
struct Cli {
    /// TCP port to listen on.
    port: u16,

    /// Concurrency model.
    #[arg(value_enum)]
    mode: Mode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// One OS thread per client connection.
    Tpc,
    /// Readiness-notification loop with a worker pool.
    Reactor,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = match cli.mode {
        Mode::Tpc => ServerMode::ThreadPerConnection,
        Mode::Reactor => ServerMode::Reactor,
    };
    let config = ServerConfig::new(cli.port, mode);

    tracing::info!("Starting stompd");
    tracing::info!("  Port: {}", cli.port);
    tracing::info!("  Mode: {}", mode);
    tracing::info!("  Audit sink: {}", config.audit_addr);

    let audit = Arc::new(TcpAuditLog::new(config.audit_addr));
    let server = Server::bind(config, audit)?;
    server.serve()?;

    Ok(())
}
