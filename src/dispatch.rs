//! Maps decoded command lines to handler calls and responses.
//!
//! Handlers run to completion on the caller's task. The reader loop awaits
//! `dispatch` before reading the next frame, so at most one command is in
//! flight and responses leave in the order commands arrived.

use std::sync::Arc;

use tracing::warn;

use crate::error::AgentError;
use crate::handlers::HandlerRegistry;
use crate::protocol::{self, Command, ParseResult, Response};

pub struct Dispatcher {
    handlers: Arc<dyn HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<dyn HandlerRegistry>) -> Self {
        Self { handlers }
    }

    /// Handle one line. `None` for blank input.
    ///
    /// Handler and argument errors are answered on the wire, never
    /// returned.
    pub async fn dispatch(&self, line: &str) -> Option<Response> {
        let command = match protocol::parse(line) {
            ParseResult::Empty => return None,
            ParseResult::Malformed(line) => {
                let err = AgentError::MalformedCommand(line);
                warn!(error = %err, "Rejecting command");
                return Some(Response::download_invalid_format());
            }
            ParseResult::Complete(command) => command,
        };

        let response = match command {
            Command::Ping => Response::pong(),

            Command::Download { url, filename } => {
                let result = self.handlers.download(&url, &filename).await;
                if result.ok {
                    Response::download_success(&filename)
                } else {
                    let err = AgentError::Handler(format!("download of {url} failed"));
                    warn!(error = %err, filename = %filename, "Reporting DOWNLOAD_FAIL");
                    Response::download_fail(&result.payload)
                }
            }

            Command::Execute { command_line } => {
                let timeout = self.handlers.execute_timeout();
                let result = self.handlers.execute(&command_line, timeout).await;
                if result.ok {
                    Response::execute_result(&result.payload)
                } else {
                    let err = AgentError::Handler(format!(
                        "`{command_line}` failed: {}",
                        result.payload
                    ));
                    warn!(error = %err, "Reporting EXECUTE_ERROR");
                    Response::execute_error(&result.payload)
                }
            }

            Command::Unknown(line) => {
                warn!(command = %line, "Unknown command");
                Response::unknown_command(&line)
            }
        };

        Some(response)
    }
}
