//! Agent wire protocol: command parsing and response formatting.
//!
//! Frames are newline-delimited text lines.
//!
//! Inbound:
//! - `PING`
//! - `DOWNLOAD <url> <filename>`
//! - `EXECUTE <rest of line>`
//!
//! Outbound:
//! - `HEARTBEAT`, `PONG`
//! - `DOWNLOAD_SUCCESS <filename>`, `DOWNLOAD_FAIL <filename-or-reason>`
//! - `EXECUTE_RESULT <text>`, `EXECUTE_ERROR <text>`
//! - `UNKNOWN_COMMAND <received line>`

use std::borrow::Cow;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Maximum characters of handler output carried in a response.
pub const MAX_PAYLOAD_CHARS: usize = 500;

/// Appended to payloads cut at `MAX_PAYLOAD_CHARS`.
pub const TRUNCATION_MARKER: &str = "...";

const DOWNLOAD_PREFIX: &str = "DOWNLOAD ";
const EXECUTE_PREFIX: &str = "EXECUTE ";

/// Parsed inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe from the controller
    Ping,
    /// Fetch `url` and store it as `filename`
    Download { url: String, filename: String },
    /// Run a shell command line verbatim
    Execute { command_line: String },
    /// Anything unrecognized, kept as received
    Unknown(String),
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Blank line, nothing to do.
    Empty,
    /// Successfully parsed command.
    Complete(Command),
    /// Recognized verb with the wrong argument shape.
    Malformed(String),
}

/// Parse one decoded, trimmed line.
///
/// Forms are checked in order: exact `PING`, `DOWNLOAD ` prefix,
/// `EXECUTE ` prefix, then everything else is `Unknown`.
pub fn parse(line: &str) -> ParseResult {
    if line.is_empty() {
        return ParseResult::Empty;
    }

    if line == "PING" {
        return ParseResult::Complete(Command::Ping);
    }

    if line.starts_with(DOWNLOAD_PREFIX) {
        // verb, url, filename; the filename keeps any further spaces
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        return match parts.as_slice() {
            [_, url, filename] if !url.is_empty() && !filename.is_empty() => {
                ParseResult::Complete(Command::Download {
                    url: url.to_string(),
                    filename: filename.to_string(),
                })
            }
            _ => ParseResult::Malformed(line.to_string()),
        };
    }

    if let Some(rest) = line.strip_prefix(EXECUTE_PREFIX) {
        return ParseResult::Complete(Command::Execute {
            command_line: rest.to_string(),
        });
    }

    ParseResult::Complete(Command::Unknown(line.to_string()))
}

/// A fully formed outbound line, without its delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    text: String,
}

impl Response {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// `<verb> <payload>`, with the payload folded onto one line and then
    /// truncated.
    fn with_payload(verb: &str, payload: &str) -> Self {
        let flat = single_line(payload);
        Self::new(format!("{verb} {}", truncate_payload(&flat)))
    }

    pub fn heartbeat() -> Self {
        Self::new("HEARTBEAT")
    }

    pub fn pong() -> Self {
        Self::new("PONG")
    }

    pub fn download_success(filename: &str) -> Self {
        Self::with_payload("DOWNLOAD_SUCCESS", filename)
    }

    pub fn download_fail(reason: &str) -> Self {
        Self::with_payload("DOWNLOAD_FAIL", reason)
    }

    /// Response for a DOWNLOAD with the wrong number of arguments.
    pub fn download_invalid_format() -> Self {
        Self::new("DOWNLOAD_FAIL invalid_format")
    }

    pub fn execute_result(output: &str) -> Self {
        Self::with_payload("EXECUTE_RESULT", output)
    }

    pub fn execute_error(output: &str) -> Self {
        Self::with_payload("EXECUTE_ERROR", output)
    }

    pub fn unknown_command(line: &str) -> Self {
        Self::new(format!("UNKNOWN_COMMAND {line}"))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Wire encoding: the text followed by the delimiter.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.text.len() + 1);
        frame.extend_from_slice(self.text.as_bytes());
        frame.push(DELIMITER);
        frame
    }
}

/// Replace line breaks with single spaces so a payload cannot span frames.
///
/// `\r\n` counts as one break; a trailing break is dropped.
pub fn single_line(payload: &str) -> Cow<'_, str> {
    if !payload.contains(['\n', '\r']) {
        return Cow::Borrowed(payload);
    }
    Cow::Owned(payload.lines().collect::<Vec<_>>().join(" ").replace('\r', " "))
}

/// Cut `payload` to `MAX_PAYLOAD_CHARS` characters, marking the cut.
pub fn truncate_payload(payload: &str) -> Cow<'_, str> {
    match payload.char_indices().nth(MAX_PAYLOAD_CHARS) {
        None => Cow::Borrowed(payload),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&payload[..cut]);
            out.push_str(TRUNCATION_MARKER);
            Cow::Owned(out)
        }
    }
}
