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


//! Download executor
//!
//! Owns the job registry and the event dispatcher and runs one spawned
//! worker per active job. There is no concurrency limit.
//!
//! # Workers
//! - Tracks are fetched through the [`TransferBackend`] into
//!   `{file}.part` and renamed into place when the transfer finishes.
//! - Playlists with member tracks fetch them one after another into
//!   `playlist_{id}/`; tracks already there are skipped, so a retry or
//!   resume continues with the first missing track. The first failing
//!   track fails the whole job.
//! - Playlists without member tracks advance a simulated transfer in
//!   fixed steps. Resume continues from the paused percentage.
//!
//! # Stopping
//! `cancel` and `pause` update the job first, then fire the worker's
//! cancellation token and wait for the worker to exit. A worker whose
//! entry was taken away never touches the job again. Cancel deletes
//! partial data; pause keeps it for a ranged resume.

use crate::config::DownloadConfig;
use crate::download::events::{
    CompletedCallback, DownloadListeners, EventDispatcher, FailedCallback, ProgressCallback,
};
use crate::download::models::{
    AudioQuality, DownloadCompletedEvent, DownloadFailedEvent, DownloadJob, DownloadProgressEvent,
    DownloadStatus, ItemKind,
};
use crate::download::progress::{ProgressSample, ProgressTracker};
use crate::download::registry::JobRegistry;
use crate::download::transfer::{
    HttpTransfer, TransferBackend, TransferOutcome, TransferProgressFn, TransferRequest,
};
use crate::error::{LibraryError, Result};
use crate::library::models::{LibraryPlaylist, LibraryTrack};
use crate::storage::files::{sanitize_file_name, DownloadsDirectory};
use crate::storage::manifest::{ManifestEntry, MetadataManifest};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Speed reported by simulated playlist transfers (bytes per second)
pub const SIMULATED_SPEED: f64 = 1024.0 * 1024.0;

/// What a job fetches, kept for resume and retry
#[derive(Debug)]
enum JobPayload {
    Track(LibraryTrack),
    Playlist(LibraryPlaylist),
}

/// Active download worker handle
struct ActiveDownload {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// `{file}.{job id}.part` beside the final path
///
/// Partial data belongs to one job, so two jobs for the same item never
/// write into each other's file.
fn partial_path(destination: &Path, job_id: &str) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", sanitize_file_name(job_id)));
    destination.with_file_name(name)
}

/// Runs downloads and tracks their jobs
pub struct DownloadExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    config: DownloadConfig,
    backend: Arc<dyn TransferBackend>,
    registry: JobRegistry,
    events: EventDispatcher,
    manifest: Arc<MetadataManifest>,
    downloads: DownloadsDirectory,
    payloads: RwLock<HashMap<String, Arc<JobPayload>>>,
    workers: Mutex<HashMap<String, ActiveDownload>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl DownloadExecutor {
    pub fn new(
        config: DownloadConfig,
        backend: Arc<dyn TransferBackend>,
        manifest: Arc<MetadataManifest>,
        downloads: DownloadsDirectory,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                backend,
                registry: JobRegistry::new(),
                events: EventDispatcher::new(),
                manifest,
                downloads,
                payloads: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Executor backed by [`HttpTransfer`] with paths taken from `config`
    pub fn with_http(config: DownloadConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(HttpTransfer::new(config.request_timeout())?);
        let manifest = Arc::new(MetadataManifest::new(config.manifest_path()));
        let downloads = DownloadsDirectory::new(config.downloads_dir());
        Ok(Self::new(config, backend, manifest, downloads))
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> &Arc<MetadataManifest> {
        &self.inner.manifest
    }

    pub fn downloads(&self) -> &DownloadsDirectory {
        &self.inner.downloads
    }

    /// Start downloading a track, returns the new job id
    ///
    /// The worker may emit events before the caller gets to register
    /// callbacks; use [`download_track_with`](Self::download_track_with)
    /// to observe every event.
    pub fn download_track(&self, track: &LibraryTrack, quality: AudioQuality) -> Result<String> {
        self.download_track_with(track, quality, DownloadListeners::default())
    }

    /// Start downloading a track with callbacks registered up front
    pub fn download_track_with(
        &self,
        track: &LibraryTrack,
        quality: AudioQuality,
        listeners: DownloadListeners,
    ) -> Result<String> {
        self.ensure_running()?;
        let job = self
            .inner
            .registry
            .create_job(ItemKind::Track, &track.job_source(), quality);
        info!("Queued track download {} ({})", job.id, track.title);
        self.start(job.id, JobPayload::Track(track.clone()), listeners)
    }

    /// Start downloading a playlist, returns the new job id
    pub fn download_playlist(&self, playlist: &LibraryPlaylist, quality: AudioQuality) -> Result<String> {
        self.download_playlist_with(playlist, quality, DownloadListeners::default())
    }

    /// Start downloading a playlist with callbacks registered up front
    pub fn download_playlist_with(
        &self,
        playlist: &LibraryPlaylist,
        quality: AudioQuality,
        listeners: DownloadListeners,
    ) -> Result<String> {
        self.ensure_running()?;
        let job = self
            .inner
            .registry
            .create_job(ItemKind::Playlist, &playlist.job_source(), quality);
        info!(
            "Queued playlist download {} ({}, {} tracks)",
            job.id,
            playlist.title,
            playlist.tracks.len()
        );
        self.start(job.id, JobPayload::Playlist(playlist.clone()), listeners)
    }

    fn start(&self, id: String, payload: JobPayload, listeners: DownloadListeners) -> Result<String> {
        self.inner.payloads.write().insert(id.clone(), Arc::new(payload));
        self.inner.events.register(&id, listeners);
        self.inner.launch(&id);
        Ok(id)
    }

    /// Cancel a job and delete its partial data
    ///
    /// Cancelling an already cancelled job is a no-op.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.inner
            .registry
            .update(id, |job| job.transition(DownloadStatus::Cancelled))??;
        self.inner.events.remove_listener(id);
        self.inner.stop_worker(id).await;
        self.inner.remove_partial_data(id).await;
        info!("Cancelled download {}", id);
        Ok(())
    }

    /// Pause a job, keeping partial data
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.inner.registry.update(id, |job| {
            job.transition(DownloadStatus::Paused)?;
            job.speed = None;
            job.estimated_time_remaining = None;
            Ok::<_, LibraryError>(())
        })??;
        self.inner.stop_worker(id).await;
        info!("Paused download {}", id);
        Ok(())
    }

    /// Continue a paused job
    pub fn resume(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.registry.update(id, |job| {
            if job.status != DownloadStatus::Paused {
                return Err(LibraryError::invalid_state(format!(
                    "Download {} is {}, only paused downloads can be resumed",
                    id, job.status
                )));
            }
            job.transition(DownloadStatus::Downloading)
        })??;
        self.inner.launch(id);
        info!("Resumed download {}", id);
        Ok(())
    }

    /// Restart a failed job under the same id
    pub fn retry(&self, id: &str) -> Result<DownloadJob> {
        self.retry_with(id, DownloadListeners::default())
    }

    /// Restart a failed job with callbacks registered up front
    pub fn retry_with(&self, id: &str, listeners: DownloadListeners) -> Result<DownloadJob> {
        self.ensure_running()?;
        let job = self.inner.registry.update(id, |job| {
            if job.status != DownloadStatus::Failed {
                return Err(LibraryError::invalid_state(format!(
                    "Download {} is {}, only failed downloads can be retried",
                    id, job.status
                )));
            }
            job.reset_for_retry();
            Ok(job.clone())
        })??;
        self.inner.events.register(id, listeners);
        self.inner.launch(id);
        info!("Retrying download {}", id);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Option<DownloadJob> {
        self.inner.registry.get_job(id)
    }

    /// All jobs in creation order
    pub fn list_jobs(&self) -> Vec<DownloadJob> {
        self.inner.registry.list_jobs()
    }

    pub fn on_progress(&self, id: &str, callback: ProgressCallback) {
        self.inner.events.on_progress(id, callback);
    }

    pub fn on_completed(&self, id: &str, callback: CompletedCallback) {
        self.inner.events.on_completed(id, callback);
    }

    pub fn on_failed(&self, id: &str, callback: FailedCallback) {
        self.inner.events.on_failed(id, callback);
    }

    pub fn remove_listener(&self, id: &str) {
        self.inner.events.remove_listener(id);
    }

    pub fn has_listeners(&self, id: &str) -> bool {
        self.inner.events.has_listeners(id)
    }

    /// Number of running workers
    pub fn active_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Stop every worker and forget every job
    pub async fn clear_jobs(&self) {
        let stopped = self.inner.stop_all().await;
        for job in self.inner.registry.list_jobs() {
            self.inner.events.remove_listener(&job.id);
            if !job.status.is_finished() {
                self.inner.remove_partial_data(&job.id).await;
            }
        }
        self.inner.registry.clear();
        self.inner.payloads.write().clear();
        debug!("Cleared all download jobs ({} workers stopped)", stopped);
    }

    /// Stop all workers; running jobs are left paused
    ///
    /// Waits up to the configured grace period. Further downloads are
    /// refused with `LibraryError::Shutdown`.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let stopped = self.inner.stop_all().await;
        info!("Download executor shut down ({} workers stopped)", stopped);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(LibraryError::Shutdown);
        }
        Ok(())
    }
}

impl ExecutorInner {
    /// Spawn a worker for `id`, replacing any previous one
    fn launch(self: &Arc<Self>, id: &str) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        // Held across the spawn so the worker cannot finish before it is registered
        let mut workers = self.workers.lock();

        let inner = Arc::clone(self);
        let worker_id = id.to_string();
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            let result = inner.execute(&worker_id, &worker_token).await;
            inner.finish(&worker_id, generation, result).await;
        });

        if let Some(previous) = workers.insert(
            id.to_string(),
            ActiveDownload {
                generation,
                token,
                handle,
            },
        ) {
            previous.token.cancel();
        }
    }

    /// Cancel a worker and wait for it to exit
    async fn stop_worker(&self, id: &str) {
        let active = self.workers.lock().remove(id);
        if let Some(active) = active {
            active.token.cancel();
            if timeout(self.config.shutdown_grace(), active.handle).await.is_err() {
                warn!("Worker for {} did not stop within the grace period", id);
            }
        }
    }

    /// Cancel every worker, leaving their jobs paused
    async fn stop_all(&self) -> usize {
        let active: Vec<(String, ActiveDownload)> = self.workers.lock().drain().collect();
        let count = active.len();

        let mut handles = Vec::with_capacity(count);
        for (id, download) in active {
            let _ = self.registry.update(&id, |job| {
                if matches!(job.status, DownloadStatus::Pending | DownloadStatus::Downloading) {
                    job.status = DownloadStatus::Paused;
                    job.speed = None;
                    job.estimated_time_remaining = None;
                }
            });
            download.token.cancel();
            handles.push(download.handle);
        }

        if timeout(self.config.shutdown_grace(), join_all(handles)).await.is_err() {
            warn!("Some download workers did not stop within the grace period");
        }
        count
    }

    async fn execute(self: &Arc<Self>, id: &str, token: &CancellationToken) -> Result<TransferOutcome> {
        if token.is_cancelled() {
            return Err(LibraryError::Cancelled);
        }

        // Paused jobs only leave Paused through `resume`
        let job = self.registry.update(id, |job| {
            match job.status {
                DownloadStatus::Pending => job.transition(DownloadStatus::Downloading)?,
                DownloadStatus::Downloading => {}
                other => {
                    return Err(LibraryError::invalid_state(format!(
                        "Download {} is {} and will not start",
                        id, other
                    )))
                }
            }
            Ok(job.clone())
        })??;

        let payload = self
            .payloads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LibraryError::job_not_found(id))?;

        self.downloads.ensure_exists().await;

        match payload.as_ref() {
            JobPayload::Track(track) => self.fetch_track(&job, track, token).await,
            JobPayload::Playlist(playlist) if playlist.tracks.is_empty() => {
                self.simulate_playlist(&job, token).await
            }
            JobPayload::Playlist(playlist) => self.fetch_playlist(&job, playlist, token).await,
        }
    }

    async fn fetch_track(
        self: &Arc<Self>,
        job: &DownloadJob,
        track: &LibraryTrack,
        token: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let destination = self.downloads.track_file_path(&track.artist, &track.title);
        let tracker = Arc::new(Mutex::new(ProgressTracker::for_job(job)));
        let reporter = self.progress_reporter(&job.id, tracker, 0, 0, job.total_size);

        // A paused job whose transfer had already finished only needs committing
        let reuse_existing = job.downloaded_size > 0;
        let size = self
            .fetch_into(&job.id, &track.url, &destination, reuse_existing, token, reporter)
            .await?;

        Ok(TransferOutcome {
            path: destination,
            size,
        })
    }

    async fn fetch_playlist(
        self: &Arc<Self>,
        job: &DownloadJob,
        playlist: &LibraryPlaylist,
        token: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let dir = self.downloads.playlist_path(&playlist.id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            LibraryError::FileIoError(format!(
                "Failed to create playlist directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut sizes: Vec<u64> = playlist
            .tracks
            .iter()
            .map(|t| job.quality.estimated_file_size(t.duration))
            .collect();
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(
            sizes.iter().sum(),
            job.downloaded_size,
            job.progress,
        )));

        let mut done = 0u64;
        for (index, track) in playlist.tracks.iter().enumerate() {
            if token.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }

            let destination = dir.join(sanitize_file_name(&format!(
                "{} - {}.mp3",
                track.artist, track.title
            )));
            let others: u64 = sizes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, size)| *size)
                .sum();
            let reporter =
                self.progress_reporter(&job.id, Arc::clone(&tracker), done, others, sizes[index]);

            let size = self
                .fetch_into(&job.id, &track.url, &destination, true, token, reporter)
                .await
                .map_err(|e| {
                    if !matches!(e, LibraryError::Cancelled) {
                        warn!(
                            "Playlist {} failed on track {} ({}): {}",
                            job.id, index, track.title, e
                        );
                    }
                    e
                })?;

            sizes[index] = size;
            done += size;
            let sample = tracker.lock().update(done, sizes.iter().sum());
            self.report_progress(&job.id, sample);
        }

        Ok(TransferOutcome { path: dir, size: done })
    }

    async fn simulate_playlist(
        self: &Arc<Self>,
        job: &DownloadJob,
        token: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let interval = self.config.playlist_step_interval();
        let step = self.config.playlist_step_percent.max(1);
        let total = job.total_size;
        let mut progress = job.progress;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(LibraryError::Cancelled),
                _ = sleep(interval) => {}
            }

            progress = progress.saturating_add(step).min(100);
            if progress >= 100 {
                break;
            }

            let remaining = (100 - progress) as f64;
            self.report_progress(
                &job.id,
                ProgressSample {
                    progress,
                    downloaded_size: (total as f64 * progress as f64 / 100.0).round() as u64,
                    total_size: total,
                    speed: SIMULATED_SPEED,
                    estimated_time_remaining: remaining * interval.as_secs_f64(),
                },
            );
        }

        Ok(TransferOutcome {
            path: self.downloads.playlist_path(&job.item_id),
            size: total,
        })
    }

    /// Fetch into the job's partial file, then rename into place
    ///
    /// With `reuse_existing`, a finished file and no partial one means the
    /// transfer already happened.
    async fn fetch_into(
        &self,
        job_id: &str,
        url: &str,
        destination: &Path,
        reuse_existing: bool,
        token: &CancellationToken,
        on_progress: TransferProgressFn,
    ) -> Result<u64> {
        let partial = partial_path(destination, job_id);
        let has_partial = DownloadsDirectory::file_exists(&partial).await;

        if reuse_existing && !has_partial && DownloadsDirectory::file_exists(destination).await {
            let size = tokio::fs::metadata(destination).await?.len();
            debug!("Reusing {} ({} bytes)", destination.display(), size);
            return Ok(size);
        }

        let outcome = self
            .backend
            .fetch(
                TransferRequest {
                    url: url.to_string(),
                    destination: partial.clone(),
                    resume: has_partial,
                },
                token.clone(),
                on_progress,
            )
            .await?;

        tokio::fs::rename(&partial, destination).await.map_err(|e| {
            LibraryError::FileIoError(format!(
                "Failed to move {} into place: {}",
                destination.display(),
                e
            ))
        })?;

        Ok(outcome.size)
    }

    /// Progress hook for one transfer
    ///
    /// `base` bytes are already done, `others` is the size of everything
    /// else in the job, `estimate` stands in until the server reports a size.
    fn progress_reporter(
        self: &Arc<Self>,
        id: &str,
        tracker: Arc<Mutex<ProgressTracker>>,
        base: u64,
        others: u64,
        estimate: u64,
    ) -> TransferProgressFn {
        let inner = Arc::clone(self);
        let id = id.to_string();
        Box::new(move |bytes, reported_total| {
            let current = if reported_total > 0 { reported_total } else { estimate };
            let sample = tracker.lock().update(base + bytes, others + current);
            inner.report_progress(&id, sample);
        })
    }

    fn report_progress(&self, id: &str, sample: ProgressSample) {
        let downloading = self
            .registry
            .update(id, |job| {
                if job.status != DownloadStatus::Downloading {
                    return false;
                }
                job.progress = sample.progress;
                job.downloaded_size = sample.downloaded_size;
                job.total_size = sample.total_size;
                job.speed = Some(sample.speed);
                job.estimated_time_remaining = Some(sample.estimated_time_remaining);
                true
            })
            .unwrap_or(false);

        if downloading {
            self.events.notify_progress(DownloadProgressEvent {
                download_id: id.to_string(),
                progress: sample.progress,
                downloaded_size: sample.downloaded_size,
                total_size: sample.total_size,
                speed: sample.speed,
                estimated_time_remaining: sample.estimated_time_remaining,
            });
        }
    }

    async fn finish(&self, id: &str, generation: u64, result: Result<TransferOutcome>) {
        let current = {
            let mut workers = self.workers.lock();
            if workers.get(id).map(|w| w.generation) == Some(generation) {
                workers.remove(id);
                true
            } else {
                false
            }
        };

        let status = self.registry.status(id);
        if !current {
            // Stopped by cancel, pause or shutdown; they own the job state now
            if status == Some(DownloadStatus::Cancelled) {
                self.remove_partial_data(id).await;
            }
            return;
        }

        match result {
            Ok(outcome) => self.commit(id, outcome).await,
            Err(LibraryError::Cancelled) => {
                if status == Some(DownloadStatus::Cancelled) {
                    self.remove_partial_data(id).await;
                }
            }
            Err(e) => {
                let failed = self
                    .registry
                    .update(id, |job| {
                        if matches!(job.status, DownloadStatus::Pending | DownloadStatus::Downloading) {
                            job.mark_failed(e.to_string());
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);

                if failed {
                    error!("Download {} failed: {}", id, e);
                    self.events.notify_failed(DownloadFailedEvent {
                        download_id: id.to_string(),
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                } else {
                    debug!("Download {} stopped: {}", id, e);
                }
            }
        }
    }

    /// Record a finished transfer and mark the job completed
    async fn commit(&self, id: &str, outcome: TransferOutcome) {
        let Some(job) = self.registry.get_job(id) else {
            return;
        };
        if job.status == DownloadStatus::Cancelled {
            self.discard_output(&outcome.path).await;
            return;
        }

        let file_path = outcome.path.to_string_lossy().into_owned();
        let entry = ManifestEntry {
            id: job.item_id.clone(),
            kind: job.kind,
            file_path: file_path.clone(),
            downloaded_at: chrono::Utc::now().to_rfc3339(),
            size: outcome.size,
            quality: job.quality,
        };
        if let Err(e) = self.manifest.record(&job.item_id, entry).await {
            error!("Failed to record {} in the manifest: {}", job.item_id, e);
        }

        // A pause that lost the race to the last byte still completes
        let committed = self
            .registry
            .update(id, |job| {
                if matches!(job.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                    job.mark_completed(outcome.size);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if !committed {
            if let Err(e) = self.manifest.remove(&job.item_id).await {
                warn!("Failed to drop manifest entry for {}: {}", job.item_id, e);
            }
            self.discard_output(&outcome.path).await;
            return;
        }

        info!("Download {} completed ({} bytes)", id, outcome.size);
        self.events.notify_completed(DownloadCompletedEvent {
            download_id: id.to_string(),
            item_id: job.item_id,
            kind: job.kind,
            file_path,
            size: outcome.size,
        });
    }

    async fn discard_output(&self, path: &Path) {
        if self.downloads.contains(path) {
            if let Err(e) = self.downloads.safe_delete(path).await {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
    }

    /// Delete `.part` files belonging to a job
    async fn remove_partial_data(&self, id: &str) {
        let payload = self.payloads.read().get(id).cloned();
        let Some(payload) = payload else {
            return;
        };

        let partials: Vec<PathBuf> = match payload.as_ref() {
            JobPayload::Track(track) => {
                vec![partial_path(
                    &self.downloads.track_file_path(&track.artist, &track.title),
                    id,
                )]
            }
            JobPayload::Playlist(playlist) => {
                let dir = self.downloads.playlist_path(&playlist.id);
                playlist
                    .tracks
                    .iter()
                    .map(|t| {
                        partial_path(
                            &dir.join(sanitize_file_name(&format!(
                                "{} - {}.mp3",
                                t.artist, t.title
                            ))),
                            id,
                        )
                    })
                    .collect()
            }
        };

        for path in partials {
            if let Err(e) = self.downloads.safe_delete(&path).await {
                warn!("Failed to delete partial file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    /// Writes `chunks` chunks of `chunk_size` bytes with a delay between them
    struct ChunkedTransfer {
        chunks: u64,
        chunk_size: u64,
        delay: Duration,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        cancelled: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl ChunkedTransfer {
        fn new(chunks: u64, chunk_size: u64, delay: Duration) -> Self {
            Self {
                chunks,
                chunk_size,
                delay,
                failures_left: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                resumes: AtomicUsize::new(0),
            }
        }

        fn failing(self, times: usize) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TransferBackend for ChunkedTransfer {
        async fn fetch(
            &self,
            request: TransferRequest,
            cancel: CancellationToken,
            mut on_progress: TransferProgressFn,
        ) -> Result<TransferOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LibraryError::network_error("connection reset", true));
            }

            let total = self.chunks * self.chunk_size;
            let mut written = 0;
            if request.resume {
                self.resumes.fetch_add(1, Ordering::SeqCst);
                written = tokio::fs::metadata(&request.destination)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(request.resume)
                .write(true)
                .truncate(!request.resume)
                .open(&request.destination)
                .await?;

            while written < total {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        return Err(LibraryError::Cancelled);
                    }
                    _ = sleep(self.delay) => {}
                }
                file.write_all(&vec![7u8; self.chunk_size as usize]).await?;
                file.flush().await?;
                written += self.chunk_size;
                on_progress(written, total);
            }

            Ok(TransferOutcome {
                path: request.destination,
                size: written,
            })
        }
    }

    struct Fixture {
        _temp: TempDir,
        executor: DownloadExecutor,
        backend: Arc<ChunkedTransfer>,
    }

    fn fixture(backend: ChunkedTransfer, step_ms: u64) -> Fixture {
        let temp = TempDir::new().unwrap();
        let config = DownloadConfig {
            playlist_step_interval_ms: step_ms,
            shutdown_grace_ms: 1000,
            ..DownloadConfig::new(temp.path())
        };
        let backend = Arc::new(backend);
        let executor = DownloadExecutor::new(
            config.clone(),
            backend.clone(),
            Arc::new(MetadataManifest::new(config.manifest_path())),
            DownloadsDirectory::new(config.downloads_dir()),
        );
        Fixture {
            _temp: temp,
            executor,
            backend,
        }
    }

    fn track(id: &str) -> LibraryTrack {
        LibraryTrack::new(id, format!("Song {}", id), "The Band", format!("https://cdn.example.com/{}.mp3", id), 10.0)
    }

    async fn wait_for_status(executor: &DownloadExecutor, id: &str, status: DownloadStatus) -> DownloadJob {
        for _ in 0..500 {
            if let Some(job) = executor.get_job(id) {
                if job.status == status {
                    return job;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}: {:?}", id, status, executor.get_job(id));
    }

    async fn wait_for_progress(executor: &DownloadExecutor, id: &str) {
        for _ in 0..500 {
            if executor.get_job(id).map(|j| j.progress > 0).unwrap_or(false) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never made progress", id);
    }

    #[tokio::test]
    async fn test_track_download_completes_and_records_manifest() {
        let f = fixture(ChunkedTransfer::new(10, 100, Duration::from_millis(1)), 200);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(None));

        let p = Arc::clone(&progress);
        let c = Arc::clone(&completed);
        let id = f
            .executor
            .download_track_with(
                &track("t1"),
                AudioQuality::High,
                DownloadListeners::new()
                    .progress(move |e| p.lock().push(e.progress))
                    .completed(move |e| *c.lock() = Some(e)),
            )
            .unwrap();

        let job = wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        assert_eq!(job.progress, 100);
        assert_eq!(job.total_size, 1000);
        assert!(job.completed_at.is_some());

        let seen = progress.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert!(seen.iter().all(|p| *p < 100));

        let event = completed.lock().clone().unwrap();
        assert_eq!(event.item_id, "t1");
        assert_eq!(event.size, 1000);
        let path = PathBuf::from(&event.file_path);
        assert!(path.ends_with("The_Band_-_Song_t1.mp3"));
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 1000);
        assert!(!partial_path(&path, &id).exists());

        let entry = f.executor.manifest().get("t1").await.unwrap();
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.kind, ItemKind::Track);
        assert!(!f.executor.has_listeners(&id));
    }

    #[tokio::test]
    async fn test_same_track_twice_gets_two_pending_jobs() {
        let f = fixture(ChunkedTransfer::new(1, 1, Duration::from_millis(1)), 200);
        let a = f.executor.download_track(&track("t1"), AudioQuality::Low).unwrap();
        let b = f.executor.download_track(&track("t1"), AudioQuality::Low).unwrap();

        assert_ne!(a, b);
        // Workers have not been polled yet on the current-thread runtime
        assert_eq!(f.executor.get_job(&a).unwrap().status, DownloadStatus::Pending);
        assert_eq!(f.executor.get_job(&b).unwrap().status, DownloadStatus::Pending);
        f.executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_jobs_for_one_track_both_complete() {
        let f = fixture(ChunkedTransfer::new(10, 100, Duration::from_millis(2)), 200);
        let a = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &a).await;
        let b = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();

        let first = wait_for_status(&f.executor, &a, DownloadStatus::Completed).await;
        let second = wait_for_status(&f.executor, &b, DownloadStatus::Completed).await;
        assert_eq!(first.total_size, 1000);
        assert_eq!(second.total_size, 1000);
        assert_eq!(f.backend.resumes.load(Ordering::SeqCst), 0);

        let dest = f.executor.downloads().track_file_path("The Band", "Song t1");
        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 1000);
        assert_eq!(f.executor.manifest().get("t1").await.unwrap().size, 1000);
        let entries = f.executor.downloads().list_entries().await.unwrap();
        assert_eq!(entries, vec![dest]);
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer_and_removes_partial() {
        let f = fixture(ChunkedTransfer::new(1000, 10, Duration::from_millis(5)), 200);
        let id = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &id).await;

        f.executor.cancel(&id).await.unwrap();

        assert_eq!(f.backend.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(f.executor.active_count(), 0);
        let job = f.executor.get_job(&id).unwrap();
        assert_eq!(job.status, DownloadStatus::Cancelled);
        assert!(job.progress < 100);

        let dest = f.executor.downloads().track_file_path("The Band", "Song t1");
        assert!(!partial_path(&dest, &id).exists());
        assert!(!dest.exists());
        assert!(f.executor.manifest().get("t1").await.is_none());

        // Terminal
        assert!(f.executor.resume(&id).is_err());
        f.executor.cancel(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_keeps_partial_and_resume_continues() {
        let f = fixture(ChunkedTransfer::new(40, 10, Duration::from_millis(5)), 200);
        let id = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &id).await;

        f.executor.pause(&id).await.unwrap();
        let paused = f.executor.get_job(&id).unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        let dest = f.executor.downloads().track_file_path("The Band", "Song t1");
        assert!(partial_path(&dest, &id).exists());

        f.executor.resume(&id).unwrap();
        let job = wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        assert!(job.progress >= paused.progress);
        assert_eq!(f.backend.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 400);
    }

    #[tokio::test]
    async fn test_failure_then_retry_keeps_id() {
        let f = fixture(ChunkedTransfer::new(5, 10, Duration::from_millis(1)).failing(1), 200);
        let failed = Arc::new(Mutex::new(None));
        let fl = Arc::clone(&failed);

        let id = f
            .executor
            .download_track_with(
                &track("t1"),
                AudioQuality::Medium,
                DownloadListeners::new().failed(move |e| *fl.lock() = Some(e)),
            )
            .unwrap();

        let job = wait_for_status(&f.executor, &id, DownloadStatus::Failed).await;
        assert!(job.error.as_deref().unwrap_or_default().contains("connection reset"));
        let event = failed.lock().clone().unwrap();
        assert!(event.retryable);
        assert!(!f.executor.has_listeners(&id));

        let retried = f.executor.retry(&id).unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.status, DownloadStatus::Pending);
        assert_eq!(retried.progress, 0);
        assert!(retried.error.is_none());

        wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        assert_eq!(f.executor.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_job() {
        let f = fixture(ChunkedTransfer::new(1, 1, Duration::from_millis(1)), 200);
        let id = f.executor.download_track(&track("t1"), AudioQuality::Low).unwrap();
        wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;

        assert!(matches!(f.executor.retry(&id), Err(LibraryError::InvalidState(_))));
        assert!(matches!(f.executor.retry("missing"), Err(LibraryError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_simulated_playlist_cancel_before_next_tick() {
        let f = fixture(ChunkedTransfer::new(1, 1, Duration::from_millis(1)), 50);
        let playlist = LibraryPlaylist::new("p1", "Focus", "Editors", 600.0, 12);
        let id = f.executor.download_playlist(&playlist, AudioQuality::High).unwrap();

        sleep(Duration::from_millis(10)).await;
        f.executor.cancel(&id).await.unwrap();
        sleep(Duration::from_millis(120)).await;

        let job = f.executor.get_job(&id).unwrap();
        assert_eq!(job.status, DownloadStatus::Cancelled);
        assert!(job.progress < 100);
        assert_eq!(job.progress, 0);
    }

    #[tokio::test]
    async fn test_simulated_playlist_completes() {
        let f = fixture(ChunkedTransfer::new(1, 1, Duration::from_millis(1)), 1);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&progress);
        let playlist = LibraryPlaylist::new("p1", "Focus", "Editors", 200.0, 3);

        let id = f
            .executor
            .download_playlist_with(
                &playlist,
                AudioQuality::High,
                DownloadListeners::new().progress(move |e| p.lock().push(e)),
            )
            .unwrap();

        let job = wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        assert_eq!(job.progress, 100);
        assert_eq!(job.total_size, 8_000_000);

        let events = progress.lock().clone();
        assert_eq!(events.len(), 19);
        assert_eq!(events[0].progress, 5);
        assert_eq!(events[0].speed, SIMULATED_SPEED);
        assert!(events.iter().all(|e| e.progress < 100));

        let entry = f.executor.manifest().get("p1").await.unwrap();
        assert_eq!(entry.kind, ItemKind::Playlist);
        assert!(entry.file_path.ends_with("playlist_p1"));
    }

    #[tokio::test]
    async fn test_simulated_playlist_resumes_from_paused_progress() {
        let f = fixture(ChunkedTransfer::new(1, 1, Duration::from_millis(1)), 20);
        let playlist = LibraryPlaylist::new("p1", "Focus", "Editors", 200.0, 3);
        let id = f.executor.download_playlist(&playlist, AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &id).await;

        f.executor.pause(&id).await.unwrap();
        let paused = f.executor.get_job(&id).unwrap().progress;
        assert!(paused > 0 && paused < 100);

        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&progress);
        f.executor.on_progress(&id, Arc::new(move |e| p.lock().push(e.progress)));
        f.executor.resume(&id).unwrap();

        wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        let seen = progress.lock().clone();
        assert!(seen.first().map(|p| *p > paused).unwrap_or(true), "{:?}", seen);
    }

    #[tokio::test]
    async fn test_playlist_tracks_are_fetched_and_skipped_on_retry() {
        let f = fixture(ChunkedTransfer::new(3, 10, Duration::from_millis(1)), 200);
        let playlist = LibraryPlaylist::new("p2", "Mix", "me", 0.0, 0)
            .with_tracks(vec![track("a"), track("b")]);

        let id = f.executor.download_playlist(&playlist, AudioQuality::Low).unwrap();
        let job = wait_for_status(&f.executor, &id, DownloadStatus::Completed).await;
        assert_eq!(job.total_size, 60);

        let dir = f.executor.downloads().playlist_path("p2");
        assert!(dir.join("The_Band_-_Song_a.mp3").exists());
        assert!(dir.join("The_Band_-_Song_b.mp3").exists());
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);

        // Same playlist again: both tracks are already on disk
        let again = f.executor.download_playlist(&playlist, AudioQuality::Low).unwrap();
        wait_for_status(&f.executor, &again, DownloadStatus::Completed).await;
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_pauses_running_jobs_and_refuses_new_ones() {
        let f = fixture(ChunkedTransfer::new(1000, 10, Duration::from_millis(5)), 200);
        let id = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &id).await;

        f.executor.shutdown().await;

        assert_eq!(f.executor.get_job(&id).unwrap().status, DownloadStatus::Paused);
        assert_eq!(f.executor.active_count(), 0);
        assert!(matches!(
            f.executor.download_track(&track("t2"), AudioQuality::High),
            Err(LibraryError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_clear_jobs_forgets_everything() {
        let f = fixture(ChunkedTransfer::new(1000, 10, Duration::from_millis(5)), 200);
        let id = f.executor.download_track(&track("t1"), AudioQuality::High).unwrap();
        wait_for_progress(&f.executor, &id).await;

        f.executor.clear_jobs().await;

        assert!(f.executor.list_jobs().is_empty());
        assert_eq!(f.executor.active_count(), 0);
        let dest = f.executor.downloads().track_file_path("The Band", "Song t1");
        assert!(!partial_path(&dest, &id).exists());
    }
}
