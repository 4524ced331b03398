// Offline Library - offline downloads for mobile music streaming
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Resumable file transfer
//!
//! The executor only sees [`TransferBackend`]; [`HttpTransfer`] is the
//! production implementation on top of reqwest.
//!
//! # Resume Mechanism
//! 1. Bytes already in the destination file are the write position
//! 2. Send Range header: bytes={position}-
//! 3. 206 Partial Content: total comes from Content-Range, append
//! 4. 200 OK: server ignored the range, truncate and start over
//! 5. 416 Range Not Satisfiable: done if the file already holds the
//!    advertised total, otherwise start over from byte 0
//!
//! A 206 whose total is smaller than the bytes on disk also starts over;
//! the partial file belongs to a different version of the resource.
//!
//! # Cancellation
//! Every transfer races its body stream against a `CancellationToken`; when
//! the token fires the stream is dropped and the connection closed, so a
//! cancelled or paused download stops using bandwidth immediately.

use crate::error::{LibraryError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::warn;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

const DOWNLOAD_BUFF_SZ: usize = 64 * 1024;
const DATA_FLUSH_SZ: u64 = 1024 * 1024; // Flush every 1MB

/// Progress hook: `(total_bytes_written, total_bytes_expected)`
///
/// `total_bytes_expected` is zero when the server sent no length.
pub type TransferProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// One file to fetch
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Continue from the bytes already in `destination`
    pub resume: bool,
}

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub size: u64,
}

/// Resumable download primitive
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Fetch `request.url` into `request.destination`
    ///
    /// Must return `LibraryError::Cancelled` promptly once `cancel` fires.
    async fn fetch(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
        on_progress: TransferProgressFn,
    ) -> Result<TransferOutcome>;
}

/// Validate a download URL (http/https only)
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(LibraryError::InvalidDownloadUrl(format!(
            "Unsupported scheme '{}' in {}",
            other, raw
        ))),
    }
}

/// Parse the total from `Content-Range: bytes 1000-1999/2000`
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    header.split('/').nth(1).and_then(|s| s.trim().parse::<u64>().ok())
}

/// Resumable HTTP downloader
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    /// Create a downloader with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Request the next byte range and work out where writing starts
    async fn request_next_byte_range(&self, url: &str, write_position: u64) -> Result<RangeStart> {
        let mut position = write_position;
        loop {
            let mut request = self.client.get(url);
            if position > 0 {
                request = request.header("Range", format!("bytes={}-", position));
            }

            let response = request.send().await.map_err(|e| {
                LibraryError::network_error(format!("Request failed: {}", e), true)
            })?;

            match response.status() {
                StatusCode::OK => {
                    // Full content; a non-zero position means the range was ignored
                    let total = response.content_length().unwrap_or(0);
                    return Ok(RangeStart::Body {
                        response,
                        write_position: 0,
                        total,
                    });
                }
                StatusCode::PARTIAL_CONTENT => {
                    let total = content_range_total(&response).ok_or_else(|| {
                        LibraryError::DownloadFailed("Invalid Content-Range header".to_string())
                    })?;
                    if total < position {
                        warn!(
                            "{} is {} bytes but {} are on disk, starting over",
                            url, total, position
                        );
                        position = 0;
                        continue;
                    }
                    return Ok(RangeStart::Body {
                        response,
                        write_position: position,
                        total,
                    });
                }
                StatusCode::RANGE_NOT_SATISFIABLE if position > 0 => {
                    if content_range_total(&response) == Some(position) {
                        return Ok(RangeStart::Complete { total: position });
                    }
                    warn!("{} rejected range from byte {}, starting over", url, position);
                    position = 0;
                }
                status => {
                    return Err(LibraryError::UnexpectedStatusCode {
                        status_code: status.as_u16(),
                        url: url.to_string(),
                    })
                }
            }
        }
    }
}

/// Where a transfer picks up after the first response
enum RangeStart {
    /// Stream `response` from `write_position`; `total` is 0 if unknown
    Body {
        response: reqwest::Response,
        write_position: u64,
        total: u64,
    },
    /// The file on disk already holds every byte
    Complete { total: u64 },
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

#[async_trait]
impl TransferBackend for HttpTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
        mut on_progress: TransferProgressFn,
    ) -> Result<TransferOutcome> {
        validate_url(&request.url)?;

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LibraryError::FileIoError(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let existing = if request.resume {
            tokio::fs::metadata(&request.destination)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        let start = tokio::select! {
            result = self.request_next_byte_range(&request.url, existing) => result?,
            _ = cancel.cancelled() => return Err(LibraryError::Cancelled),
        };
        let (response, mut write_position, total) = match start {
            RangeStart::Body {
                response,
                write_position,
                total,
            } => (response, write_position, total),
            RangeStart::Complete { total } => {
                on_progress(total, total);
                return Ok(TransferOutcome {
                    path: request.destination,
                    size: total,
                });
            }
        };

        let file = if write_position > 0 {
            OpenOptions::new()
                .append(true)
                .open(&request.destination)
                .await?
        } else {
            tokio::fs::File::create(&request.destination).await?
        };
        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);

        on_progress(write_position, total);

        let mut stream = response.bytes_stream();
        let mut next_flush = write_position + DATA_FLUSH_SZ;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    writer.flush().await?;
                    return Err(LibraryError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| {
                LibraryError::network_error(format!("Stream error: {}", e), true)
            })?;

            writer.write_all(&chunk).await?;
            write_position += chunk.len() as u64;

            if write_position >= next_flush {
                writer.flush().await?;
                next_flush = write_position + DATA_FLUSH_SZ;
            }

            on_progress(write_position, total);
        }

        writer.flush().await?;

        if total > 0 && write_position < total {
            return Err(LibraryError::DownloadFailed(format!(
                "Download incomplete: {}/{} bytes",
                write_position, total
            )));
        }

        Ok(TransferOutcome {
            path: request.destination,
            size: write_position,
        })
    }
}
