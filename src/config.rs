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


//! Configuration for the download engine and persisted user preferences

use crate::download::models::AudioQuality;
use crate::error::{LibraryError, Result};
use crate::library::models::LibraryTab;
use crate::storage::files::atomic_write;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes in one gigabyte of the download quota
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Paths and timings for the download engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// App document directory; everything else lives under it
    pub document_directory: PathBuf,
    pub downloads_subdirectory: String,
    pub manifest_file_name: String,
    pub settings_file_name: String,
    /// Tick interval of simulated playlist downloads
    pub playlist_step_interval_ms: u64,
    /// Percentage added per simulated tick
    pub playlist_step_percent: u8,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// How long shutdown waits for workers after cancelling them
    pub shutdown_grace_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            document_directory: PathBuf::from("."),
            downloads_subdirectory: "downloads".to_string(),
            manifest_file_name: "library_metadata.json".to_string(),
            settings_file_name: "library_settings.json".to_string(),
            playlist_step_interval_ms: 200,
            playlist_step_percent: 5,
            request_timeout_secs: 300,
            shutdown_grace_ms: 2000,
        }
    }
}

impl DownloadConfig {
    pub fn new(document_directory: impl Into<PathBuf>) -> Self {
        Self {
            document_directory: document_directory.into(),
            ..Self::default()
        }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.document_directory.join(&self.downloads_subdirectory)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.document_directory.join(&self.manifest_file_name)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.document_directory.join(&self.settings_file_name)
    }

    pub fn playlist_step_interval(&self) -> Duration {
        Duration::from_millis(self.playlist_step_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject values the executor cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.downloads_subdirectory.trim().is_empty() {
            return Err(LibraryError::InvalidConfiguration(
                "downloads_subdirectory must not be empty".to_string(),
            ));
        }
        if self.manifest_file_name.trim().is_empty() || self.settings_file_name.trim().is_empty() {
            return Err(LibraryError::InvalidConfiguration(
                "file names must not be empty".to_string(),
            ));
        }
        if self.playlist_step_percent == 0 || self.playlist_step_percent > 100 {
            return Err(LibraryError::InvalidConfiguration(format!(
                "playlist_step_percent must be in 1..=100, got {}",
                self.playlist_step_percent
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(LibraryError::InvalidConfiguration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Offline preferences the user can change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibrarySettings {
    pub is_offline_mode: bool,
    pub offline_quality: AudioQuality,
    /// Download quota in gigabytes
    pub max_download_size: u32,
    pub download_over_wifi_only: bool,
    pub selected_tab: LibraryTab,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            is_offline_mode: false,
            offline_quality: AudioQuality::High,
            max_download_size: 5,
            download_over_wifi_only: true,
            selected_tab: LibraryTab::Liked,
        }
    }
}

impl LibrarySettings {
    /// Quota in bytes
    pub fn max_download_bytes(&self) -> u64 {
        self.max_download_size as u64 * BYTES_PER_GB
    }

    /// Load settings; a missing or corrupt file yields defaults
    pub async fn load(path: &Path) -> Self {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read settings {}: {}", path.display(), e);
                }
                return Self::default();
            }
        };

        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Settings {} are corrupt, using defaults: {}", path.display(), e);
            Self::default()
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &data).await
    }
}
