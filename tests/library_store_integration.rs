//! Integration tests for LibraryStore
//!
//! Drives the store end to end against a temporary document directory.
//! Transfers go through an in-process backend instead of the network.

use async_trait::async_trait;
use library_core::download::models::{AudioQuality, DownloadStatus, ItemKind};
use library_core::download::transfer::TransferProgressFn;
use library_core::download::{DownloadExecutor, TransferBackend, TransferOutcome, TransferRequest};
use library_core::library::{LibraryTab, LibraryTrack, NetworkKind};
use library_core::storage::{DownloadsDirectory, MetadataManifest};
use library_core::{DownloadConfig, LibraryError, LibraryStore, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const FILE_SIZE: u64 = 4096;

/// Writes `FILE_SIZE` bytes, failing the first `failures` calls
struct LocalTransfer {
    failures: AtomicUsize,
}

impl LocalTransfer {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl TransferBackend for LocalTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        cancel: CancellationToken,
        mut on_progress: TransferProgressFn,
    ) -> Result<TransferOutcome> {
        if cancel.is_cancelled() {
            return Err(LibraryError::Cancelled);
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LibraryError::network_error("connection reset", true));
        }

        tokio::fs::write(&request.destination, vec![1u8; FILE_SIZE as usize]).await?;
        on_progress(FILE_SIZE, FILE_SIZE);
        Ok(TransferOutcome {
            path: request.destination,
            size: FILE_SIZE,
        })
    }
}

async fn open_store(dir: &TempDir, failures: usize) -> LibraryStore {
    let config = DownloadConfig::new(dir.path());
    let executor = DownloadExecutor::new(
        config.clone(),
        Arc::new(LocalTransfer::new(failures)),
        Arc::new(MetadataManifest::new(config.manifest_path())),
        DownloadsDirectory::new(config.downloads_dir()),
    );
    LibraryStore::with_executor(executor).await
}

fn track(id: &str) -> LibraryTrack {
    LibraryTrack::new(
        id,
        format!("Song {}", id),
        "Night Drive",
        format!("https://cdn.example.com/{}.mp3", id),
        180.0,
    )
}

async fn wait_for_status(store: &LibraryStore, id: &str, status: DownloadStatus) {
    for _ in 0..500 {
        if store.executor().get_job(id).map(|j| j.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("download {} never reached {}", id, status);
}

async fn wait_for_downloaded(store: &LibraryStore, track_id: &str) {
    for _ in 0..500 {
        if store.snapshot().downloaded_tracks.iter().any(|t| t.id == track_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("track {} never showed up as downloaded", track_id);
}

#[tokio::test]
async fn test_completed_track_lands_in_library_and_manifest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;

    let id = store.download_track(&track("t1"), None).unwrap();
    wait_for_downloaded(&store, "t1").await;

    let state = store.snapshot();
    let downloaded = &state.downloaded_tracks[0];
    assert_eq!(downloaded.id, "t1");
    assert!(downloaded.is_downloaded);
    assert_eq!(downloaded.download_size, Some(FILE_SIZE));
    assert!(state
        .download_jobs
        .iter()
        .any(|j| j.id == id && j.status == DownloadStatus::Completed));

    let entry = store.executor().manifest().get("t1").await.unwrap();
    assert_eq!(entry.kind, ItemKind::Track);
    assert_eq!(entry.size, FILE_SIZE);
    assert_eq!(entry.quality, AudioQuality::High);
    assert!(tokio::fs::metadata(&entry.file_path).await.is_ok());

    // A fresh store rebuilds the same item from disk
    let reopened = open_store(&dir, 0).await;
    reopened.load_downloads().await;
    let state = reopened.snapshot();
    assert_eq!(state.downloaded_tracks.len(), 1);
    assert_eq!(state.total_download_size, FILE_SIZE);
}

#[tokio::test]
async fn test_remove_download_twice_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;

    store.download_track(&track("t1"), None).unwrap();
    wait_for_downloaded(&store, "t1").await;
    let path = store.executor().manifest().get("t1").await.unwrap().file_path;

    store.remove_download("t1", ItemKind::Track).await;
    store.remove_download("t1", ItemKind::Track).await;

    assert_eq!(store.error(), None);
    assert!(store.executor().manifest().get("t1").await.is_none());
    assert!(tokio::fs::metadata(&path).await.is_err());
    let state = store.snapshot();
    assert!(state.downloaded_tracks.is_empty());
    assert_eq!(state.total_download_size, 0);
}

#[tokio::test]
async fn test_clear_all_downloads_leaves_empty_manifest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;

    for id in ["t1", "t2"] {
        store.download_track(&track(id), None).unwrap();
        wait_for_downloaded(&store, id).await;
    }

    store.clear_all_downloads().await;

    assert_eq!(store.error(), None);
    let manifest_path = store.executor().config().manifest_path();
    let raw = tokio::fs::read_to_string(&manifest_path).await.unwrap();
    assert_eq!(raw.trim(), "{}");

    let state = store.snapshot();
    assert!(state.downloaded_tracks.is_empty());
    assert!(state.download_jobs.is_empty());
    assert_eq!(state.total_download_size, 0);
    assert!(store.executor().downloads().list_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wifi_only_blocks_cellular_downloads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;
    assert!(store.settings().download_over_wifi_only);

    store.set_network_kind(NetworkKind::Cellular);
    assert!(store.download_track(&track("t1"), None).is_none());
    assert!(store.error().unwrap().contains("Wi-Fi"));
    assert!(store.executor().list_jobs().is_empty());

    store.clear_error();
    store.set_download_over_wifi_only(false).await;
    assert!(store.download_track(&track("t1"), None).is_some());
}

#[tokio::test]
async fn test_offline_network_blocks_downloads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;

    store.set_network_kind(NetworkKind::Offline);
    assert!(store.download_track(&track("t1"), None).is_none());
    assert!(store.error().unwrap().contains("offline"));
}

#[tokio::test]
async fn test_quota_refuses_download() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;
    store.set_max_download_size(0).await;

    assert!(store.download_track(&track("t1"), None).is_none());
    assert!(store.error().unwrap().contains("limit"));
    assert!(store.executor().list_jobs().is_empty());
}

#[tokio::test]
async fn test_corrupt_manifest_loads_as_empty() {
    let dir = TempDir::new().unwrap();
    let config = DownloadConfig::new(dir.path());
    tokio::fs::write(config.manifest_path(), b"{ not json").await.unwrap();

    let store = open_store(&dir, 0).await;
    store.load_downloads().await;

    assert_eq!(store.error(), None);
    let state = store.snapshot();
    assert!(state.downloaded_tracks.is_empty());
    assert!(state.downloaded_playlists.is_empty());
    assert!(!state.is_loading);
}

#[tokio::test]
async fn test_retry_after_failure_keeps_job_id() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1).await;

    let id = store.download_track(&track("t1"), None).unwrap();
    wait_for_status(&store, &id, DownloadStatus::Failed).await;

    let failed = store.executor().get_job(&id).unwrap();
    assert!(failed.error.is_some());

    store.retry_download(&id);
    wait_for_downloaded(&store, "t1").await;

    let job = store.executor().get_job(&id).unwrap();
    assert_eq!(job.status, DownloadStatus::Completed);
    assert_eq!(job.error, None);
    assert_eq!(store.executor().list_jobs().len(), 1);
}

#[tokio::test]
async fn test_settings_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir, 0).await;
        store.set_offline_quality(AudioQuality::Lossless).await;
        store.set_max_download_size(12).await;
        store.set_selected_tab(LibraryTab::Downloads).await;
        store.set_offline_mode(true).await;
        assert_eq!(store.error(), None);
    }

    let store = open_store(&dir, 0).await;
    let settings = store.settings();
    assert_eq!(settings.offline_quality, AudioQuality::Lossless);
    assert_eq!(settings.max_download_size, 12);
    assert_eq!(settings.selected_tab, LibraryTab::Downloads);
    assert!(settings.is_offline_mode);
    assert!(settings.download_over_wifi_only);
}

#[tokio::test]
async fn test_cleanup_drops_entries_for_missing_files() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;

    store.download_track(&track("t1"), None).unwrap();
    wait_for_downloaded(&store, "t1").await;
    let path = store.executor().manifest().get("t1").await.unwrap().file_path;
    tokio::fs::remove_file(&path).await.unwrap();

    store.cleanup_old_downloads().await;

    assert!(store.executor().manifest().get("t1").await.is_none());
    assert!(store.snapshot().downloaded_tracks.is_empty());
}

#[tokio::test]
async fn test_remove_download_keeps_tracks_whose_names_hold_the_id() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;
    let song = LibraryTrack::new("1", "Song", "A", "https://cdn.example.com/1.mp3", 60.0);
    let other = LibraryTrack::new("t2", "Track 1", "B", "https://cdn.example.com/t2.mp3", 60.0);

    for track in [&song, &other] {
        store.download_track(track, None).unwrap();
        wait_for_downloaded(&store, &track.id).await;
    }
    let kept = store.executor().manifest().get("t2").await.unwrap().file_path;
    assert!(kept.ends_with("B_-_Track_1.mp3"));

    store.remove_download("1", ItemKind::Track).await;

    assert_eq!(store.error(), None);
    assert!(store.executor().manifest().get("1").await.is_none());
    assert!(tokio::fs::metadata(&kept).await.is_ok());
    let state = store.snapshot();
    let ids: Vec<&str> = state.downloaded_tracks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t2"]);
    assert_eq!(state.total_download_size, FILE_SIZE);
}

#[tokio::test]
async fn test_cancel_download_clears_listeners_and_mirrors_status() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 0).await;
    let id = store.download_track(&track("t1"), None).unwrap();

    store.cancel_download(&id).await;

    assert_eq!(store.error(), None);
    assert!(!store.executor().has_listeners(&id));
    let state = store.snapshot();
    assert!(state
        .download_jobs
        .iter()
        .any(|j| j.id == id && j.status == DownloadStatus::Cancelled));
}
