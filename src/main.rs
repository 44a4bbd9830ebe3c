//! linewire-agent: a persistent remote-command agent
//!
//! Holds one TCP session to a control endpoint and speaks a
//! newline-delimited text protocol over it:
//! - `PING` is answered with `PONG`
//! - `DOWNLOAD <url> <filename>` fetches a file over HTTP
//! - `EXECUTE <command line>` runs a shell command and returns its output
//! - a `HEARTBEAT` frame goes out on a fixed interval
//!
//! Configuration comes from CLI arguments or a TOML file. The process
//! exits when the session ends; it does not reconnect.

mod agent;
mod config;
mod dispatch;
mod error;
mod frame;
mod handlers;
mod heartbeat;
mod protocol;
mod session;

use std::sync::Arc;

use agent::Connection;
use config::Config;
use dispatch::Dispatcher;
use handlers::Handlers;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        endpoint = %config.endpoint(),
        heartbeat_interval = ?config.heartbeat_interval,
        read_buffer_size = config.read_buffer_size,
        handler_timeout = ?config.handler_timeout,
        download_dir = %config.download_dir.display(),
        "Starting linewire-agent"
    );

    let handlers = Arc::new(Handlers::from_config(&config)?);

    let connection = match Connection::establish(&config).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "Failed to connect");
            return Err(e.into());
        }
    };

    let session = connection.session();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted by user");
            session.interrupt();
        }
    });

    let peer = connection.peer();
    connection
        .run(Dispatcher::new(handlers), config.heartbeat_interval)
        .await?;

    info!(peer = %peer, "Disconnected, agent stopped");
    Ok(())
}
