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


//! Download job records and the events emitted while they run
//!
//! # Job Lifecycle
//! ```text
//! pending -> downloading -> completed
//!                        -> failed    -> pending (retry)
//!                        -> paused    -> downloading (resume)
//!                        -> cancelled
//! ```
//! `completed` and `cancelled` are terminal for a job id.

use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Requested audio quality for an offline copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Medium,
    #[default]
    High,
    Lossless,
}

impl AudioQuality {
    /// All qualities in ascending bitrate order
    pub const ALL: [AudioQuality; 4] = [
        AudioQuality::Low,
        AudioQuality::Medium,
        AudioQuality::High,
        AudioQuality::Lossless,
    ];

    /// Nominal bitrate in kbps
    pub fn bitrate_kbps(&self) -> u64 {
        match self {
            AudioQuality::Low => 128,
            AudioQuality::Medium => 256,
            AudioQuality::High => 320,
            AudioQuality::Lossless => 1411, // CD quality
        }
    }

    /// Estimated file size in bytes for `duration_secs` of audio
    ///
    /// `round(duration * kbps * 1000 / 8)`; used until a real transfer
    /// reports an authoritative content length.
    pub fn estimated_file_size(&self, duration_secs: f64) -> u64 {
        if duration_secs <= 0.0 {
            return 0;
        }
        (duration_secs * self.bitrate_kbps() as f64 * 1000.0 / 8.0).round() as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Low => "low",
            AudioQuality::Medium => "medium",
            AudioQuality::High => "high",
            AudioQuality::Lossless => "lossless",
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(AudioQuality::Low),
            "medium" => Ok(AudioQuality::Medium),
            "high" => Ok(AudioQuality::High),
            "lossless" => Ok(AudioQuality::Lossless),
            other => Err(LibraryError::invalid_input(format!("Invalid audio quality: {}", other))),
        }
    }
}

/// What a download job fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Track,
    Playlist,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Track => "track",
            ItemKind::Playlist => "playlist",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "track" => Ok(ItemKind::Track),
            "playlist" => Ok(ItemKind::Playlist),
            other => Err(LibraryError::invalid_input(format!("Invalid item type: {}", other))),
        }
    }
}

/// Status of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Created, worker not yet transferring
    Pending,
    /// Transfer in progress
    Downloading,
    /// Paused by user, partial data kept
    Paused,
    /// Transfer finished and recorded in the manifest
    Completed,
    /// Transfer failed, may be retried
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the job has stopped producing events
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Whether no further transition is allowed for this job id
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }

    /// Check a state machine edge
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (*self, next),
            (Pending, Downloading)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Downloading, Paused)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient record of one transfer
///
/// Display metadata is a snapshot taken when the job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub item_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
    pub status: DownloadStatus,
    /// Percentage 0-100
    pub progress: u8,
    pub total_size: u64,
    pub downloaded_size: u64,
    /// Bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<f64>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub quality: AudioQuality,
}

impl DownloadJob {
    /// Build the `{type}_{itemId}_{timestamp}` id
    pub fn make_id(kind: ItemKind, item_id: &str, timestamp_millis: i64) -> String {
        format!("{}_{}_{}", kind.as_str(), item_id, timestamp_millis)
    }

    /// Move to `next`, rejecting edges the state machine does not allow
    pub fn transition(&mut self, next: DownloadStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(LibraryError::invalid_state(format!(
                "Download {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Reset transfer fields for a retry cycle on the same id
    pub fn reset_for_retry(&mut self) {
        self.status = DownloadStatus::Pending;
        self.progress = 0;
        self.downloaded_size = 0;
        self.speed = None;
        self.estimated_time_remaining = None;
        self.error = None;
        self.completed_at = None;
        self.started_at = chrono::Utc::now().to_rfc3339();
    }

    /// Commit a successful transfer
    pub fn mark_completed(&mut self, size: u64) {
        self.status = DownloadStatus::Completed;
        self.progress = 100;
        self.total_size = size;
        self.downloaded_size = size;
        self.estimated_time_remaining = Some(0.0);
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Record a failed transfer
    pub fn mark_failed(&mut self, message: String) {
        self.status = DownloadStatus::Failed;
        self.error = Some(message);
        self.speed = None;
        self.estimated_time_remaining = None;
    }
}

/// Progress tick for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub download_id: String,
    pub progress: u8,
    pub downloaded_size: u64,
    pub total_size: u64,
    pub speed: f64,
    pub estimated_time_remaining: f64,
}

/// Emitted once when a job completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCompletedEvent {
    pub download_id: String,
    pub item_id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub file_path: String,
    pub size: u64,
}

/// Emitted once when a job fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFailedEvent {
    pub download_id: String,
    pub error: String,
    pub retryable: bool,
}
