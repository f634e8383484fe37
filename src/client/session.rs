use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metadata::UploadMetadata;
use log::debug;
use reqwest::Client as HttpClient;
use reqwest::Response;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const TUS_RESUMABLE: &str = "Tus-Resumable";
const TUS_VERSION: &str = "1.0.0";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// TUS 1.0.0 protocol client: one instance drives any number of upload
/// sessions against a single endpoint.
#[derive(Clone)]
pub struct TusClient {
    http: HttpClient,
    endpoint: String,
    chunk_size: u64,
    retry_delays: Vec<u64>,
}

impl TusClient {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: HttpClient::new(),
            endpoint: config.endpoint.clone(),
            chunk_size: config.chunk_size,
            retry_delays: config.retry_delays.clone(),
        }
    }

    /// Creates a new upload of `length` bytes and returns its upload URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the server refuses the
    /// creation (e.g. the duplicate pre-rejection), or the `Location`
    /// header is missing or unresolvable.
    pub async fn create(&self, length: u64, metadata: &UploadMetadata) -> Result<String> {
        debug!("creating upload of {length} bytes at {}", self.endpoint);

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header("Upload-Length", length.to_string());

        let header = metadata.to_header();
        if !header.is_empty() {
            request = request.header("Upload-Metadata", header);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::ApiError(error_detail(response).await));
        }

        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::ApiError("Missing Location header".to_string()))?;

        // The server may hand back an absolute or an endpoint-relative URL.
        let base = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::ConfigError(format!("Invalid endpoint: {e}")))?;
        let upload_url = base
            .join(location)
            .map_err(|e| Error::ApiError(format!("Invalid Location header: {e}")))?;

        debug!("upload created at {upload_url}");
        Ok(upload_url.to_string())
    }

    /// Asks the server for the current persisted offset of an upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the offset header is
    /// missing.
    pub async fn offset(&self, upload_url: &str) -> Result<u64> {
        let response = self
            .http
            .head(upload_url)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::ApiError(error_detail(response).await));
        }
        upload_offset(&response)
            .ok_or_else(|| Error::ApiError("Missing Upload-Offset header".to_string()))
    }

    /// Uploads the `range` byte region of `path` over one TUS session,
    /// chunk by chunk, invoking `on_progress` with each acknowledged byte
    /// delta. Transport failures and server 5xx responses are retried per
    /// the configured delays, re-synchronizing the offset via HEAD;
    /// protocol rejections are fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the session fails
    /// past its retry budget.
    pub async fn upload_range<F>(
        &self,
        upload_url: &str,
        path: &Path,
        range: Range<u64>,
        on_progress: F,
    ) -> Result<()>
    where
        F: Fn(u64) + Send + Sync,
    {
        let mut file = tokio::fs::File::open(path).await?;
        let total = range.end - range.start;
        let mut acked: u64 = 0;
        let mut attempt: usize = 0;

        loop {
            let len = self.chunk_size.min(total - acked);
            file.seek(SeekFrom::Start(range.start + acked)).await?;
            #[allow(clippy::cast_possible_truncation)]
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk).await?;

            match self.patch_chunk(upload_url, acked, chunk).await {
                Ok(new_offset) => {
                    on_progress(new_offset.saturating_sub(acked));
                    acked = new_offset;
                    attempt = 0;
                }
                Err(e) if attempt < self.retry_delays.len() && is_retryable(&e) => {
                    let delay = self.retry_delays[attempt];
                    attempt += 1;
                    debug!(
                        "chunk at offset {acked} failed ({e}), retry {attempt} in {delay}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;

                    // Re-synchronize with whatever the server persisted.
                    if let Ok(offset) = self.offset(upload_url).await {
                        on_progress(offset.saturating_sub(acked));
                        acked = acked.max(offset);
                    }
                }
                Err(e) => return Err(e),
            }

            if acked >= total {
                return Ok(());
            }
        }
    }

    async fn patch_chunk(&self, upload_url: &str, offset: u64, chunk: Vec<u8>) -> Result<u64> {
        let chunk_len = chunk.len() as u64;
        let response = self
            .http
            .patch(upload_url)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header("Upload-Offset", offset.to_string())
            .header("Content-Type", OFFSET_CONTENT_TYPE)
            .body(chunk)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::UploadError(error_detail(response).await));
        }
        if !status.is_success() {
            return Err(Error::ApiError(error_detail(response).await));
        }

        Ok(upload_offset(&response).unwrap_or(offset + chunk_len))
    }
}

fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::HttpError(_) | Error::UploadError(_))
}

fn upload_offset(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("Upload-Offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn error_detail(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(ToString::to_string))
        .unwrap_or(body);
    format!("Status {status}: {message}")
}
