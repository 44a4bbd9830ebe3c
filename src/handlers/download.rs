//! DOWNLOAD handler: fetch a URL over HTTP and store the body locally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::HandlerResult;

#[derive(Debug, Error)]
enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to write {}: {}", .path.display(), .source)]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetches URLs into files under a base directory.
pub struct DownloadHandler {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl DownloadHandler {
    /// The timeout bounds the whole request, body included.
    pub fn new(download_dir: PathBuf, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            download_dir,
        })
    }

    /// Download `url` to `filename`.
    ///
    /// Both outcomes carry the filename as payload; the failure reason is
    /// only logged.
    pub async fn fetch(&self, url: &str, filename: &str) -> HandlerResult {
        let path = self.download_dir.join(filename);
        match self.try_fetch(url, &path).await {
            Ok(size) => {
                info!(url, path = %path.display(), bytes = size, "Download saved");
                HandlerResult::success(filename)
            }
            Err(e) => {
                warn!(url, error = %e, "Download failed");
                HandlerResult::failure(filename)
            }
        }
    }

    async fn try_fetch(&self, url: &str, path: &Path) -> Result<usize, DownloadError> {
        debug!(url, "Fetching");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        tokio::fs::write(path, &body)
            .await
            .map_err(|source| DownloadError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(body.len())
    }
}
