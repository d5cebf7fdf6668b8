//! raw-echo: a single-threaded raw TCP echo reactor
//!
//! Accepts up to a fixed number of concurrent connections, writes every byte
//! received to stdout and echoes it back to the sender. Connections beyond
//! the limit are accepted and closed immediately. Once no connection has been
//! open for a full idle window the listener is closed and the process exits.
//!
//! Features:
//! - Bounded connection slots with overflow rejection
//! - Per-connection buffer recycling with a loan cap
//! - Keep-alive wakes while busy, graceful idle shutdown
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("raw-echo: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize logging; stdout carries the received payload
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = %config.port,
        max_connections = config.max_connections,
        idle_timeout_ms = config.idle_timeout_ms,
        keepalive_interval_ms = config.keepalive_interval_ms,
        "Starting raw-echo"
    );

    match runtime::run(config) {
        Ok(status) => {
            info!(code = status.code(), "Reactor stopped");
            status.into()
        }
        Err(e) => {
            error!(error = %e, "Reactor failed");
            ExitCode::FAILURE
        }
    }
}
