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


//! Library state store
//!
//! Application-facing facade over the executor and the storage layer.
//! Every action catches its own failure and keeps a user-facing message
//! in `LibraryState::error`; nothing is returned as an error and nothing
//! is retried automatically.
//!
//! # Job Mirror
//! `download_jobs` follows the executor through the per-job callbacks the
//! store registers when it starts a download. Completion also prepends the
//! item to the downloaded list (replacing an older record for the same id).
//!
//! # Policy
//! New downloads are refused when the user limited downloads to Wi-Fi and
//! the device is on another network, or when the download would push the
//! library past its size quota.

use crate::config::{DownloadConfig, LibrarySettings};
use crate::download::events::DownloadListeners;
use crate::download::executor::DownloadExecutor;
use crate::download::models::{
    AudioQuality, DownloadCompletedEvent, DownloadFailedEvent, DownloadJob, DownloadProgressEvent,
    DownloadStatus, ItemKind,
};
use crate::error::{LibraryError, Result};
use crate::library::models::{
    LibraryPlaylist, LibraryStats, LibraryState, LibraryTab, LibraryTrack, LikedPlaylist,
    LikedTrack, NetworkKind,
};
use crate::storage::files::DownloadsDirectory;
use crate::storage::manifest::ManifestEntry;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Catalog record behind a job, kept to rebuild listeners on retry
#[derive(Debug, Clone)]
enum DownloadItem {
    Track(LibraryTrack),
    Playlist(LibraryPlaylist),
}

/// The offline library
pub struct LibraryStore {
    executor: DownloadExecutor,
    state: Arc<RwLock<LibraryState>>,
    items: RwLock<HashMap<String, DownloadItem>>,
    network: RwLock<NetworkKind>,
    settings_path: PathBuf,
}

impl LibraryStore {
    /// Open the library under `config.document_directory` with HTTP transfers
    pub async fn open(config: DownloadConfig) -> Result<Self> {
        let executor = DownloadExecutor::with_http(config)?;
        Ok(Self::with_executor(executor).await)
    }

    /// Wrap an executor; settings are read from its document directory
    pub async fn with_executor(executor: DownloadExecutor) -> Self {
        let settings_path = executor.config().settings_path();
        let settings = LibrarySettings::load(&settings_path).await;
        executor.downloads().ensure_exists().await;

        let state = LibraryState {
            is_offline_mode: settings.is_offline_mode,
            offline_quality: settings.offline_quality,
            max_download_size: settings.max_download_size,
            download_over_wifi_only: settings.download_over_wifi_only,
            selected_tab: settings.selected_tab,
            ..LibraryState::default()
        };

        Self {
            executor,
            state: Arc::new(RwLock::new(state)),
            items: RwLock::new(HashMap::new()),
            network: RwLock::new(NetworkKind::default()),
            settings_path,
        }
    }

    pub fn executor(&self) -> &DownloadExecutor {
        &self.executor
    }

    fn downloads(&self) -> &DownloadsDirectory {
        self.executor.downloads()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> LibraryState {
        self.state.read().clone()
    }

    pub fn stats(&self) -> LibraryStats {
        LibraryStats::from_state(&self.state.read())
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.write().error = error;
    }

    pub fn clear_error(&self) {
        self.set_error(None);
    }

    /// Report the network the device is on
    pub fn set_network_kind(&self, kind: NetworkKind) {
        *self.network.write() = kind;
    }

    pub fn network_kind(&self) -> NetworkKind {
        *self.network.read()
    }

    fn fail(&self, action: &str, err: LibraryError) {
        warn!("{} failed: {}", action, err);
        self.set_error(Some(err.user_message()));
    }

    // ===== Liked content =====

    pub fn like_track(&self, track: &LibraryTrack) {
        let now = chrono::Utc::now();
        let liked = LikedTrack {
            id: format!("liked_{}_{}", track.id, now.timestamp_millis()),
            track_id: track.id.clone(),
            track: track.clone(),
            liked_at: now.to_rfc3339(),
            playlist_id: None,
            playlist_name: None,
        };
        let mut state = self.state.write();
        state.liked_tracks.retain(|lt| lt.track_id != track.id);
        state.liked_tracks.insert(0, liked);
    }

    pub fn unlike_track(&self, track_id: &str) {
        self.state.write().liked_tracks.retain(|lt| lt.track_id != track_id);
    }

    pub fn like_playlist(&self, playlist: &LibraryPlaylist) {
        let now = chrono::Utc::now();
        let liked = LikedPlaylist {
            id: format!("liked_playlist_{}_{}", playlist.id, now.timestamp_millis()),
            playlist_id: playlist.id.clone(),
            playlist: playlist.clone(),
            liked_at: now.to_rfc3339(),
        };
        let mut state = self.state.write();
        state.liked_playlists.retain(|lp| lp.playlist_id != playlist.id);
        state.liked_playlists.insert(0, liked);
    }

    pub fn unlike_playlist(&self, playlist_id: &str) {
        self.state
            .write()
            .liked_playlists
            .retain(|lp| lp.playlist_id != playlist_id);
    }

    // ===== Downloads =====

    /// Start a track download; `None` quality uses the offline setting
    ///
    /// Returns the job id, or `None` with the reason stored in `error`.
    pub fn download_track(&self, track: &LibraryTrack, quality: Option<AudioQuality>) -> Option<String> {
        let quality = quality.unwrap_or_else(|| self.state.read().offline_quality);
        let item = DownloadItem::Track(track.clone());
        let result = self
            .check_policy(quality.estimated_file_size(track.duration))
            .and_then(|_| {
                self.executor
                    .download_track_with(track, quality, self.listeners(&item))
            });
        self.started("Track download", item, result)
    }

    /// Start a playlist download; `None` quality uses the offline setting
    pub fn download_playlist(&self, playlist: &LibraryPlaylist, quality: Option<AudioQuality>) -> Option<String> {
        let quality = quality.unwrap_or_else(|| self.state.read().offline_quality);
        let item = DownloadItem::Playlist(playlist.clone());
        let result = self
            .check_policy(quality.estimated_file_size(playlist.duration))
            .and_then(|_| {
                self.executor
                    .download_playlist_with(playlist, quality, self.listeners(&item))
            });
        self.started("Playlist download", item, result)
    }

    fn started(&self, action: &str, item: DownloadItem, result: Result<String>) -> Option<String> {
        match result {
            Ok(id) => {
                self.items.write().insert(id.clone(), item);
                self.sync_jobs();
                Some(id)
            }
            Err(e) => {
                self.fail(action, e);
                None
            }
        }
    }

    pub async fn cancel_download(&self, download_id: &str) {
        match self.executor.cancel(download_id).await {
            Ok(()) => mirror_status(&self.state, download_id, DownloadStatus::Cancelled, None),
            Err(e) => self.fail("Cancel download", e),
        }
    }

    pub async fn pause_download(&self, download_id: &str) {
        match self.executor.pause(download_id).await {
            Ok(()) => mirror_status(&self.state, download_id, DownloadStatus::Paused, None),
            Err(e) => self.fail("Pause download", e),
        }
    }

    pub fn resume_download(&self, download_id: &str) {
        match self.executor.resume(download_id) {
            Ok(()) => mirror_status(&self.state, download_id, DownloadStatus::Downloading, None),
            Err(e) => self.fail("Resume download", e),
        }
    }

    pub fn retry_download(&self, download_id: &str) {
        let item = self.items.read().get(download_id).cloned();
        let listeners = item
            .map(|item| self.listeners(&item))
            .unwrap_or_default();

        match self.executor.retry_with(download_id, listeners) {
            Ok(job) => mirror_job(&self.state, job),
            Err(e) => self.fail("Retry download", e),
        }
    }

    /// Delete a downloaded item's files and manifest entry
    ///
    /// Removing something that is not downloaded is a no-op.
    pub async fn remove_download(&self, item_id: &str, kind: ItemKind) {
        if let Err(e) = self.try_remove_download(item_id, kind).await {
            self.fail("Remove download", e);
        }
    }

    async fn try_remove_download(&self, item_id: &str, kind: ItemKind) -> Result<()> {
        let manifest = self.executor.manifest();
        let recorded = match manifest.get(item_id).await {
            Some(entry) => Some(entry.file_path),
            None => self.recorded_path(item_id, kind),
        };
        let known = recorded.map(PathBuf::from);

        let removed = self
            .downloads()
            .remove_item_files(kind, item_id, known.as_deref())
            .await?;
        manifest.remove(item_id).await?;
        debug!("Removed {} ({} files)", item_id, removed);

        {
            let mut state = self.state.write();
            match kind {
                ItemKind::Track => state.downloaded_tracks.retain(|t| t.id != item_id),
                ItemKind::Playlist => state.downloaded_playlists.retain(|p| p.id != item_id),
            }
        }

        self.update_total_download_size().await;
        Ok(())
    }

    /// Path kept on the downloaded record when the manifest has none
    fn recorded_path(&self, item_id: &str, kind: ItemKind) -> Option<String> {
        let state = self.state.read();
        match kind {
            ItemKind::Track => state
                .downloaded_tracks
                .iter()
                .find(|t| t.id == item_id)
                .and_then(|t| t.download_path.clone()),
            ItemKind::Playlist => None,
        }
    }

    /// Stop every job and delete every download
    pub async fn clear_all_downloads(&self) {
        if let Err(e) = self.try_clear_all_downloads().await {
            self.fail("Clear downloads", e);
        }
    }

    async fn try_clear_all_downloads(&self) -> Result<()> {
        self.executor.clear_jobs().await;
        self.items.write().clear();

        let removed = self.downloads().clear().await?;
        self.executor.manifest().clear().await?;
        info!("Cleared all downloads ({} entries)", removed);

        let mut state = self.state.write();
        state.downloaded_tracks.clear();
        state.downloaded_playlists.clear();
        state.download_jobs.clear();
        state.total_download_size = 0;
        Ok(())
    }

    /// Refresh the job mirror and rebuild downloaded items from the manifest
    pub async fn load_downloads(&self) {
        self.state.write().is_loading = true;
        self.sync_jobs();

        let entries = self.executor.manifest().entries().await;
        {
            let mut state = self.state.write();
            rebuild_downloaded(&mut state, &entries);
            state.is_loading = false;
        }

        self.update_total_download_size().await;
    }

    pub async fn refresh(&self) {
        self.state.write().is_refreshing = true;
        self.load_downloads().await;
        self.check_storage_space().await;
        self.state.write().is_refreshing = false;
    }

    /// Read disk capacity for the downloads directory
    pub async fn check_storage_space(&self) {
        let info = self.downloads().storage_info().await;
        let mut state = self.state.write();
        state.available_storage = info.available;
        state.used_storage = info.used;
        state.total_storage = info.total;
    }

    /// Drop manifest entries whose files are gone
    pub async fn cleanup_old_downloads(&self) {
        if let Err(e) = self.try_cleanup_old_downloads().await {
            self.fail("Cleanup downloads", e);
        }
    }

    async fn try_cleanup_old_downloads(&self) -> Result<()> {
        let manifest = self.executor.manifest();

        let mut missing = HashSet::new();
        for (item_id, entry) in manifest.entries().await {
            if !DownloadsDirectory::file_exists(Path::new(&entry.file_path)).await {
                missing.insert(item_id);
            }
        }

        if !missing.is_empty() {
            let dropped = manifest.retain(|item_id, _| !missing.contains(item_id)).await?;
            info!("Dropped {} stale manifest entries", dropped.len());

            let mut state = self.state.write();
            state.downloaded_tracks.retain(|t| !missing.contains(&t.id));
            state.downloaded_playlists.retain(|p| !missing.contains(&p.id));
        }

        self.update_total_download_size().await;
        Ok(())
    }

    // ===== Settings =====

    pub async fn set_offline_mode(&self, enabled: bool) {
        self.state.write().is_offline_mode = enabled;
        self.save_settings().await;
    }

    pub async fn set_offline_quality(&self, quality: AudioQuality) {
        self.state.write().offline_quality = quality;
        self.save_settings().await;
    }

    /// Quota in gigabytes
    pub async fn set_max_download_size(&self, size_gb: u32) {
        self.state.write().max_download_size = size_gb;
        self.save_settings().await;
    }

    pub async fn set_download_over_wifi_only(&self, wifi_only: bool) {
        self.state.write().download_over_wifi_only = wifi_only;
        self.save_settings().await;
    }

    pub async fn set_selected_tab(&self, tab: LibraryTab) {
        self.state.write().selected_tab = tab;
        self.save_settings().await;
    }

    pub fn settings(&self) -> LibrarySettings {
        let state = self.state.read();
        LibrarySettings {
            is_offline_mode: state.is_offline_mode,
            offline_quality: state.offline_quality,
            max_download_size: state.max_download_size,
            download_over_wifi_only: state.download_over_wifi_only,
            selected_tab: state.selected_tab,
        }
    }

    async fn save_settings(&self) {
        let settings = self.settings();
        if let Err(e) = settings.save(&self.settings_path).await {
            self.fail("Save settings", e);
        }
    }

    /// Stop all running downloads
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        self.sync_jobs();
    }

    // ===== Internals =====

    fn check_policy(&self, estimate: u64) -> Result<()> {
        let network = self.network_kind();
        let settings = self.settings();

        if network == NetworkKind::Offline {
            return Err(LibraryError::PolicyViolation(
                "You are offline. Connect to a network to download.".to_string(),
            ));
        }
        if settings.download_over_wifi_only && network != NetworkKind::Wifi {
            return Err(LibraryError::PolicyViolation(
                "Downloads are limited to Wi-Fi. Connect to Wi-Fi or change your download settings."
                    .to_string(),
            ));
        }

        let limit = settings.max_download_bytes();
        let need = self.state.read().total_download_size.saturating_add(estimate);
        if need > limit {
            return Err(LibraryError::QuotaExceeded { need, limit });
        }
        Ok(())
    }

    fn sync_jobs(&self) {
        let jobs = self.executor.list_jobs();
        self.state.write().download_jobs = jobs;
    }

    async fn update_total_download_size(&self) {
        let size = self.downloads().downloaded_size().await;
        self.state.write().total_download_size = size;
    }

    /// Mirror callbacks for one download
    fn listeners(&self, item: &DownloadItem) -> DownloadListeners {
        let progress_state = Arc::clone(&self.state);
        let completed_state = Arc::clone(&self.state);
        let failed_state = Arc::clone(&self.state);
        let item = item.clone();

        DownloadListeners::new()
            .progress(move |event| mirror_progress(&progress_state, &event))
            .completed(move |event| mirror_completed(&completed_state, &item, &event))
            .failed(move |event| mirror_failed(&failed_state, &event))
    }
}

fn mirror_progress(state: &RwLock<LibraryState>, event: &DownloadProgressEvent) {
    let mut state = state.write();
    if let Some(job) = state.download_jobs.iter_mut().find(|j| j.id == event.download_id) {
        job.progress = event.progress;
        job.downloaded_size = event.downloaded_size;
        job.total_size = event.total_size;
        job.speed = Some(event.speed);
        job.estimated_time_remaining = Some(event.estimated_time_remaining);
    }
}

fn mirror_status(state: &RwLock<LibraryState>, id: &str, status: DownloadStatus, error: Option<String>) {
    let mut state = state.write();
    if let Some(job) = state.download_jobs.iter_mut().find(|j| j.id == id) {
        job.status = status;
        job.error = error;
        if status == DownloadStatus::Completed {
            job.progress = 100;
        }
    }
}

/// Replace or append a job snapshot
fn mirror_job(state: &RwLock<LibraryState>, job: DownloadJob) {
    let mut state = state.write();
    match state.download_jobs.iter_mut().find(|j| j.id == job.id) {
        Some(existing) => *existing = job,
        None => state.download_jobs.push(job),
    }
}

fn mirror_failed(state: &RwLock<LibraryState>, event: &DownloadFailedEvent) {
    mirror_status(state, &event.download_id, DownloadStatus::Failed, Some(event.error.clone()));
}

fn mirror_completed(state: &RwLock<LibraryState>, item: &DownloadItem, event: &DownloadCompletedEvent) {
    mirror_status(state, &event.download_id, DownloadStatus::Completed, None);

    let now = chrono::Utc::now().to_rfc3339();
    let mut state = state.write();
    let replaced = match item {
        DownloadItem::Track(track) => {
            let replaced = take_by_id(&mut state.downloaded_tracks, &track.id, |t| &t.id)
                .and_then(|t| t.download_size);
            state.downloaded_tracks.insert(
                0,
                LibraryTrack {
                    is_downloaded: true,
                    downloaded_at: Some(now),
                    download_path: Some(event.file_path.clone()),
                    download_size: Some(event.size),
                    ..track.clone()
                },
            );
            replaced
        }
        DownloadItem::Playlist(playlist) => {
            let replaced = take_by_id(&mut state.downloaded_playlists, &playlist.id, |p| &p.id)
                .and_then(|p| p.download_size);
            state.downloaded_playlists.insert(
                0,
                LibraryPlaylist {
                    is_downloaded: true,
                    downloaded_at: Some(now),
                    download_progress: Some(100),
                    download_size: Some(event.size),
                    ..playlist.clone()
                },
            );
            replaced
        }
    };

    // Re-measured from disk on the next load or removal
    state.total_download_size = state
        .total_download_size
        .saturating_sub(replaced.unwrap_or(0))
        .saturating_add(event.size);
}

fn take_by_id<T>(items: &mut Vec<T>, id: &str, key: impl Fn(&T) -> &String) -> Option<T> {
    let position = items.iter().position(|item| key(item) == id)?;
    Some(items.remove(position))
}

/// Make the downloaded lists match the manifest
///
/// Known records are kept (with manifest path and size); entries without a
/// record get a placeholder named after the file.
fn rebuild_downloaded(state: &mut LibraryState, entries: &[(String, ManifestEntry)]) {
    let mut tracks: HashMap<String, LibraryTrack> = state
        .downloaded_tracks
        .drain(..)
        .map(|t| (t.id.clone(), t))
        .collect();
    let mut playlists: HashMap<String, LibraryPlaylist> = state
        .downloaded_playlists
        .drain(..)
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut ordered: Vec<&(String, ManifestEntry)> = entries.iter().collect();
    ordered.sort_by(|a, b| b.1.downloaded_at.cmp(&a.1.downloaded_at));

    for (item_id, entry) in ordered {
        match entry.kind {
            ItemKind::Track => {
                let mut track = tracks.remove(item_id).unwrap_or_else(|| {
                    let title = Path::new(&entry.file_path)
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(item_id)
                        .to_string();
                    LibraryTrack::new(item_id.clone(), title, "", "", 0.0)
                });
                track.is_downloaded = true;
                track.downloaded_at = Some(entry.downloaded_at.clone());
                track.download_path = Some(entry.file_path.clone());
                track.download_size = Some(entry.size);
                state.downloaded_tracks.push(track);
            }
            ItemKind::Playlist => {
                let mut playlist = playlists
                    .remove(item_id)
                    .unwrap_or_else(|| LibraryPlaylist::new(item_id.clone(), item_id.clone(), "", 0.0, 0));
                playlist.is_downloaded = true;
                playlist.downloaded_at = Some(entry.downloaded_at.clone());
                playlist.download_progress = Some(100);
                playlist.download_size = Some(entry.size);
                state.downloaded_playlists.push(playlist);
            }
        }
    }
}
