//! Command effect handlers.
//!
//! The dispatcher only sees the `HandlerRegistry` trait. Handlers never
//! return `Err`: every failure, including a timeout, comes back as a
//! `HandlerResult` with `ok == false` so the session keeps running.

pub mod download;
pub mod execute;

pub use download::DownloadHandler;
pub use execute::ExecuteHandler;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Outcome of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub ok: bool,
    pub payload: String,
}

impl HandlerResult {
    pub fn success(payload: impl Into<String>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
        }
    }

    pub fn failure(payload: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: payload.into(),
        }
    }
}

/// Capabilities the dispatcher can invoke.
#[async_trait]
pub trait HandlerRegistry: Send + Sync {
    /// Fetch `url` and store the body under `filename`.
    async fn download(&self, url: &str, filename: &str) -> HandlerResult;

    /// Run `command_line` through the shell, giving up after `timeout`.
    async fn execute(&self, command_line: &str, timeout: Duration) -> HandlerResult;

    /// Timeout the dispatcher passes to `execute`.
    fn execute_timeout(&self) -> Duration;
}

/// Default registry backed by HTTP downloads and shell execution.
pub struct Handlers {
    download: DownloadHandler,
    execute: ExecuteHandler,
    timeout: Duration,
}

impl Handlers {
    pub fn new(download_dir: PathBuf, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            download: DownloadHandler::new(download_dir, timeout)?,
            execute: ExecuteHandler::new(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(config.download_dir.clone(), config.handler_timeout)
    }
}

#[async_trait]
impl HandlerRegistry for Handlers {
    async fn download(&self, url: &str, filename: &str) -> HandlerResult {
        self.download.fetch(url, filename).await
    }

    async fn execute(&self, command_line: &str, timeout: Duration) -> HandlerResult {
        self.execute.run(command_line, timeout).await
    }

    fn execute_timeout(&self) -> Duration {
        self.timeout
    }
}
