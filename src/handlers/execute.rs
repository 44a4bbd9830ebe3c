//! EXECUTE handler: run a command line through the platform shell.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::HandlerResult;

/// Runs shell command lines with a deadline.
#[derive(Debug, Default)]
pub struct ExecuteHandler;

impl ExecuteHandler {
    pub fn new() -> Self {
        Self
    }

    /// Run `command_line`, killing the child if it outlives `limit`.
    ///
    /// Exit status 0 yields the combined output as a success. A non-zero
    /// status yields the same output as a failure; spawn errors and
    /// timeouts yield a description of what went wrong.
    pub async fn run(&self, command_line: &str, limit: Duration) -> HandlerResult {
        let child = match shell(command_line).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = command_line, error = %e, "Failed to spawn shell");
                return HandlerResult::failure(e.to_string());
            }
        };

        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let text = combined_output(&output);
                if output.status.success() {
                    debug!(command = command_line, "Command succeeded");
                    HandlerResult::success(text)
                } else {
                    warn!(
                        command = command_line,
                        status = ?output.status.code(),
                        "Command exited with failure"
                    );
                    HandlerResult::failure(text)
                }
            }
            Ok(Err(e)) => {
                warn!(command = command_line, error = %e, "Failed to collect command output");
                HandlerResult::failure(e.to_string())
            }
            Err(_) => {
                warn!(command = command_line, timeout = ?limit, "Command timed out");
                HandlerResult::failure(format!(
                    "Command '{}' timed out after {} seconds",
                    command_line,
                    limit.as_secs()
                ))
            }
        }
    }
}

fn shell(command_line: &str) -> Command {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command_line]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command_line]);
        c
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// stdout then stderr, lossily decoded and trimmed.
fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    text.trim().to_string()
}
