// src/transport.rs

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::throttle::Throttle;

/// Errors a transfer can end with.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("transfer paused")]
    Paused,
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    /// File the bytes are written to while the transfer runs.
    pub part_path: PathBuf,
    /// Bytes already present in `part_path`; the transfer continues from here
    /// when the server supports ranges.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes in the finished file.
    pub total: u64,
}

/// Progress sink. Receives the absolute number of bytes in the part file
/// and, once known, the expected total.
pub trait Progress: Send + Sync {
    fn advance(&self, bytes: u64);
    fn set_total(&self, total: u64);
}

/// Byte-stream transfer collaborator.
///
/// Implementations must return [`TransferError::Paused`] promptly once
/// `cancel` fires and must not touch the part file afterwards.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: &TransferRequest,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError>;
}

/// Streaming HTTP transport with range resumption.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    throttle: Throttle,
}

impl HttpTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration, throttle: Throttle) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, throttle })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: &TransferRequest,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|_| TransferError::InvalidUrl(request.url.clone()))?;

        let mut builder = self.client.get(url);
        if request.offset > 0 {
            builder = builder.header(header::RANGE, format!("bytes={}-", request.offset));
        }

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Paused),
            resp = builder.send() => resp?,
        };

        let status = resp.status();
        let mut written = match status {
            StatusCode::PARTIAL_CONTENT => request.offset,
            // the whole file is already there
            StatusCode::RANGE_NOT_SATISFIABLE if request.offset > 0 => {
                progress.set_total(request.offset);
                return Ok(TransferOutcome { total: request.offset });
            }
            s if s.is_success() => 0,
            s => return Err(TransferError::Status(s)),
        };
        if request.offset > 0 && written == 0 {
            debug!(url = %request.url, "server ignored range request, restarting");
        }

        if let Some(len) = resp.content_length() {
            progress.set_total(written + len);
        }

        if let Some(parent) = request.part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(written > 0)
            .truncate(written == 0)
            .open(&request.part_path)
            .await?;
        progress.advance(written);

        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Paused);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            self.throttle.take(bytes.len() as u64).await;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
            progress.advance(written);
        }
        file.flush().await?;

        Ok(TransferOutcome { total: written })
    }
}
