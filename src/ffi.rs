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


//! uniffi exports for the mobile shell
//!
//! Helpers the shell calls without owning a library store: size estimates,
//! file naming, progress text, and read-only views of the on-disk library.
//!
//! # Response Format
//! Functions that can fail return JSON strings:
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```

use crate::config::DownloadConfig;
use crate::download::models::{AudioQuality, DownloadJob};
use crate::download::progress;
use crate::error::{LibraryError, Result};
use crate::storage::files::{sanitize_file_name, DownloadsDirectory};
use crate::storage::manifest::MetadataManifest;
use serde::Serialize;
use std::panic;

// Lazy static tokio runtime for the async storage helpers
lazy_static::lazy_static! {
    static ref RUNTIME: Option<tokio::runtime::Runtime> = tokio::runtime::Runtime::new().ok();
}

/// Convert Rust result to JSON response string
fn result_to_json<T: Serialize>(result: Result<T>) -> String {
    match result {
        Ok(data) => serde_json::json!({
            "success": true,
            "data": data
        })
        .to_string(),
        Err(e) => error_response(&e.user_message()),
    }
}

/// Create error response JSON
fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Wrap a function call with panic catching
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> String + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(result) => result,
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

fn runtime() -> Result<&'static tokio::runtime::Runtime> {
    RUNTIME
        .as_ref()
        .ok_or_else(|| LibraryError::internal("Failed to create Tokio runtime"))
}

/// Estimated size in bytes of `duration_secs` of audio at `quality`
///
/// Returns `{ "bytes": n }`.
#[uniffi::export]
pub fn estimated_download_size(duration_secs: f64, quality: String) -> String {
    catch_panic(|| {
        result_to_json(quality.parse::<AudioQuality>().map(|quality| {
            serde_json::json!({ "bytes": quality.estimated_file_size(duration_secs) })
        }))
    })
}

/// File name the library would use for `name`
#[uniffi::export]
pub fn sanitize_download_file_name(name: String) -> String {
    sanitize_file_name(&name)
}

/// One-line status text for a serialized `DownloadJob`
///
/// Returns `{ "text": "...", "speed": "...", "eta": "..." }`.
#[uniffi::export]
pub fn format_download_progress(job_json: String) -> String {
    catch_panic(|| {
        let result = serde_json::from_str::<DownloadJob>(&job_json)
            .map_err(LibraryError::from)
            .map(|job| {
                serde_json::json!({
                    "text": progress::display_string(&job),
                    "speed": progress::speed_string(job.speed.unwrap_or(0.0)),
                    "eta": progress::eta_string(job.estimated_time_remaining.unwrap_or(0.0)),
                })
            });
        result_to_json(result)
    })
}

/// Disk capacity and downloaded bytes for a document directory
///
/// Returns `{ "available", "used", "total", "downloaded" }`.
#[uniffi::export]
pub fn library_storage_info(document_directory: String) -> String {
    catch_panic(|| {
        result_to_json(runtime().map(|rt| {
            let config = DownloadConfig::new(document_directory);
            let downloads = DownloadsDirectory::new(config.downloads_dir());
            rt.block_on(async {
                let info = downloads.storage_info().await;
                let downloaded = downloads.downloaded_size().await;
                serde_json::json!({
                    "available": info.available,
                    "used": info.used,
                    "total": info.total,
                    "downloaded": downloaded,
                })
            })
        }))
    })
}

/// Manifest contents for a document directory, keyed by item id
#[uniffi::export]
pub fn library_downloaded_items(document_directory: String) -> String {
    catch_panic(|| {
        result_to_json(runtime().map(|rt| {
            let config = DownloadConfig::new(document_directory);
            let manifest = MetadataManifest::new(config.manifest_path());
            rt.block_on(manifest.load())
        }))
    })
}
