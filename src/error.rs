//! Error taxonomy for the agent.
//!
//! Transport failures (`Connect*`, `Read`, `Write`) end the session.
//! `Handler` and `MalformedCommand` never leave the dispatcher: they are
//! turned into a response frame and the session carries on.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("connecting to {endpoint} did not complete within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("failed to read from control connection: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write to control connection: {0}")]
    Write(#[source] io::Error),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
}
