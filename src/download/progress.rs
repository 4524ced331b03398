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


//! Download progress tracking and reporting
//!
//! # Progress Information
//! - Bytes downloaded / total bytes (total starts as a bitrate estimate and
//!   is replaced by the server's content length on the first tick)
//! - Percentage complete, rounded, never decreasing while downloading
//! - Speed as bytes transferred in this run divided by elapsed seconds
//! - Time remaining estimated from that speed

use crate::download::models::{DownloadJob, DownloadStatus};
use std::time::{Duration, Instant};

/// Highest percentage a running transfer may report; 100 is reserved for
/// the moment the executor commits completion.
pub const MAX_RUNNING_PERCENT: u8 = 99;

/// Derived numbers for one progress tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub progress: u8,
    pub downloaded_size: u64,
    pub total_size: u64,
    /// Bytes per second
    pub speed: f64,
    /// Seconds
    pub estimated_time_remaining: f64,
}

/// Calculate a rounded percentage from bytes
pub fn calculate_percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (downloaded as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Calculate ETA in seconds from speed and remaining bytes
pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> f64 {
    if speed > 0.0 && total > 0 {
        total.saturating_sub(downloaded) as f64 / speed
    } else {
        0.0
    }
}

/// Progress tracker for one run of a transfer
///
/// A resumed transfer starts a fresh tracker with `bytes_at_start` set to
/// the bytes already on disk, so speed only counts this run's bytes.
#[derive(Debug)]
pub struct ProgressTracker {
    /// Start time of this run
    start_time: Instant,

    /// Bytes already present when this run started
    bytes_at_start: u64,

    /// Current total (estimate until the transfer reports one)
    total_bytes: u64,

    /// Last reported percentage
    last_percent: u8,
}

impl ProgressTracker {
    /// Create new progress tracker
    pub fn new(estimated_total: u64, bytes_at_start: u64, last_percent: u8) -> Self {
        Self {
            start_time: Instant::now(),
            bytes_at_start,
            total_bytes: estimated_total,
            last_percent: last_percent.min(MAX_RUNNING_PERCENT),
        }
    }

    /// Create a tracker that continues where `job` left off
    pub fn for_job(job: &DownloadJob) -> Self {
        let last = if job.status == DownloadStatus::Completed {
            MAX_RUNNING_PERCENT
        } else {
            job.progress
        };
        Self::new(job.total_size, job.downloaded_size, last)
    }

    /// Update with the transfer's cumulative counters
    ///
    /// `expected_total` of zero means the server did not say; the current
    /// total is kept.
    pub fn update(&mut self, bytes_downloaded: u64, expected_total: u64) -> ProgressSample {
        if expected_total > 0 {
            self.total_bytes = expected_total;
        }
        self.sample(bytes_downloaded, self.elapsed())
    }

    /// Compute a sample for an explicit elapsed time
    pub fn sample(&mut self, bytes_downloaded: u64, elapsed: Duration) -> ProgressSample {
        let percent = calculate_percentage(bytes_downloaded, self.total_bytes)
            .min(MAX_RUNNING_PERCENT)
            .max(self.last_percent);
        self.last_percent = percent;

        let secs = elapsed.as_secs_f64();
        let run_bytes = bytes_downloaded.saturating_sub(self.bytes_at_start);
        let speed = if secs > 0.0 { run_bytes as f64 / secs } else { 0.0 };

        ProgressSample {
            progress: percent,
            downloaded_size: bytes_downloaded,
            total_size: self.total_bytes,
            speed,
            estimated_time_remaining: calculate_eta(bytes_downloaded, self.total_bytes, speed),
        }
    }

    /// Current total bytes
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Format download speed as human-readable string (e.g., "2.5 MB/s")
pub fn speed_string(bytes_per_sec: f64) -> String {
    let mb_per_sec = bytes_per_sec / 1_000_000.0;
    format!("{:.1} MB/s", mb_per_sec)
}

/// Format ETA as human-readable string (e.g., "5m 30s")
pub fn eta_string(eta_seconds: f64) -> String {
    let eta_seconds = eta_seconds.round() as u64;
    if eta_seconds == 0 {
        return "calculating...".to_string();
    }

    let hours = eta_seconds / 3600;
    let minutes = (eta_seconds % 3600) / 60;
    let seconds = eta_seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format bytes as human-readable string (e.g., "45.2 MB")
pub fn bytes_string(bytes: u64) -> String {
    let mb = bytes as f64 / 1_000_000.0;
    format!("{:.1} MB", mb)
}

/// Format a job as a one-line status
pub fn display_string(job: &DownloadJob) -> String {
    match job.status {
        DownloadStatus::Pending => format!("{}: Queued", job.title),
        DownloadStatus::Downloading => format!(
            "{}: {}% ({} / {}) - {} - {}",
            job.title,
            job.progress,
            bytes_string(job.downloaded_size),
            bytes_string(job.total_size),
            speed_string(job.speed.unwrap_or(0.0)),
            eta_string(job.estimated_time_remaining.unwrap_or(0.0))
        ),
        DownloadStatus::Paused => format!("{}: Paused at {}%", job.title, job.progress),
        DownloadStatus::Completed => format!("{}: Completed", job.title),
        DownloadStatus::Failed => format!(
            "{}: Failed - {}",
            job.title,
            job.error.as_deref().unwrap_or("Unknown error")
        ),
        DownloadStatus::Cancelled => format!("{}: Cancelled", job.title),
    }
}
