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


//! Downloads directory operations
//!
//! # Key Operations
//! - Directory creation (failures are logged, never fatal)
//! - File naming for tracks and playlists
//! - Deletion with retry, per item or everything
//! - Size accounting and disk capacity

use crate::download::models::ItemKind;
use crate::error::{LibraryError, Result};
use lazy_static::lazy_static;
use log::{debug, error, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::Disks;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

const GIB: u64 = 1024 * 1024 * 1024;

lazy_static! {
    static ref UNSAFE_FILE_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9.\-]").unwrap();
}

/// Replace every character outside `[A-Za-z0-9.-]` with `_`
pub fn sanitize_file_name(name: &str) -> String {
    UNSAFE_FILE_CHARS.replace_all(name, "_").into_owned()
}

/// Atomic write (write to a hidden temp file beside `path`, sync, rename)
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let temp_path = match path.parent() {
        Some(parent) => parent.join(format!(".{}.tmp", file_name)),
        None => PathBuf::from(format!(".{}.tmp", file_name)),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| {
                LibraryError::FileIoError(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let mut file = fs::File::create(&temp_path).await.map_err(|e| {
        LibraryError::FileIoError(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    file.write_all(contents).await?;
    file.sync_all().await.map_err(|e| {
        LibraryError::FileIoError(format!(
            "Failed to sync temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    drop(file);

    fs::rename(&temp_path, path).await.map_err(|e| {
        LibraryError::FileIoError(format!(
            "Failed to rename {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Disk capacity numbers in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub available: u64,
    pub used: u64,
    pub total: u64,
}

impl StorageInfo {
    /// Used when the platform reports no disk for the downloads directory
    pub fn approximate() -> Self {
        Self {
            available: 5 * GIB,
            used: 2 * GIB,
            total: 8 * GIB,
        }
    }
}

/// Manager for the downloads directory
#[derive(Debug, Clone)]
pub struct DownloadsDirectory {
    root: PathBuf,
}

impl DownloadsDirectory {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create the directory if missing
    ///
    /// Failure is logged and swallowed; later writes fail on their own.
    pub async fn ensure_exists(&self) -> bool {
        if Self::file_exists(&self.root).await {
            return true;
        }
        match fs::create_dir_all(&self.root).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Failed to create downloads directory {}: {}",
                    self.root.display(),
                    e
                );
                false
            }
        }
    }

    /// `{sanitized artist - title}.mp3` inside the downloads directory
    pub fn track_file_path(&self, artist: &str, title: &str) -> PathBuf {
        self.root
            .join(sanitize_file_name(&format!("{} - {}.mp3", artist, title)))
    }

    /// `playlist_{id}` inside the downloads directory
    pub fn playlist_path(&self, playlist_id: &str) -> PathBuf {
        self.root
            .join(sanitize_file_name(&format!("playlist_{}", playlist_id)))
    }

    /// Whether `path` sits inside the downloads directory
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root) && path != self.root
    }

    /// Delete the files of one downloaded item
    ///
    /// Tracks lose `known_path` (the manifest's record) and its partial
    /// files; playlists lose `playlist_{id}` and `known_path`. Paths outside
    /// the directory are refused and missing files are not an error. Returns
    /// how many entries were deleted.
    pub async fn remove_item_files(
        &self,
        kind: ItemKind,
        item_id: &str,
        known_path: Option<&Path>,
    ) -> Result<usize> {
        let mut targets = Vec::new();
        if let Some(path) = known_path {
            if self.contains(path) {
                targets.push(path.to_path_buf());
            } else {
                warn!(
                    "Refusing to delete {} outside of {}",
                    path.display(),
                    self.root.display()
                );
            }
        }
        if kind == ItemKind::Playlist && !item_id.is_empty() {
            let dir = self.playlist_path(item_id);
            if !targets.contains(&dir) {
                targets.push(dir);
            }
        }

        let mut removed = 0;
        for path in targets {
            if kind == ItemKind::Track {
                removed += self.remove_partials_of(&path).await?;
            }
            if Self::file_exists(&path).await {
                self.safe_delete(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the `{file}.{job}.part` siblings of `path`
    async fn remove_partials_of(&self, path: &Path) -> Result<usize> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            return Ok(0);
        };
        if parent != self.root {
            return Ok(0);
        }

        let prefix = format!("{}.", name);
        let mut removed = 0;
        for entry in self.list_entries().await? {
            let is_partial = entry
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".part"))
                .unwrap_or(false);
            if is_partial {
                self.safe_delete(&entry).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every entry in the downloads directory
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.list_entries().await? {
            self.safe_delete(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Top-level entries; a missing directory has none
    pub async fn list_entries(&self) -> Result<Vec<PathBuf>> {
        if !Self::file_exists(&self.root).await {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            LibraryError::FileIoError(format!(
                "Failed to read directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            LibraryError::FileIoError(format!(
                "Failed to read directory entry in {}: {}",
                self.root.display(),
                e
            ))
        })? {
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    /// Total bytes under the downloads directory
    ///
    /// Errors are logged and reported as zero.
    pub async fn downloaded_size(&self) -> u64 {
        match Self::dir_size(self.root.clone()).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to calculate downloaded size: {}", e);
                0
            }
        }
    }

    async fn dir_size(root: PathBuf) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![root];

        while let Some(dir) = pending.pop() {
            if !Self::file_exists(&dir).await {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    total = total.saturating_add(metadata.len());
                }
            }
        }

        Ok(total)
    }

    /// Free and total capacity of the disk holding the downloads directory
    pub async fn storage_info(&self) -> StorageInfo {
        let root = self.root.clone();
        let info = tokio::task::spawn_blocking(move || Self::query_disk(&root)).await;
        match info {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!("No disk found for {}, using approximation", self.root.display());
                StorageInfo::approximate()
            }
            Err(e) => {
                warn!("Failed to query storage info: {}", e);
                StorageInfo::default()
            }
        }
    }

    fn query_disk(path: &Path) -> Option<StorageInfo> {
        let mut target = path.to_path_buf();
        while !target.exists() {
            if !target.pop() {
                break;
            }
        }
        let target = std::fs::canonicalize(&target).unwrap_or(target);

        let disks = Disks::new_with_refreshed_list();
        let mut best: Option<(usize, StorageInfo)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if !target.starts_with(mount) {
                continue;
            }
            let score = mount.as_os_str().len();
            if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                let total = disk.total_space();
                let available = disk.available_space();
                best = Some((
                    score,
                    StorageInfo {
                        available,
                        used: total.saturating_sub(available),
                        total,
                    },
                ));
            }
        }
        best.map(|(_, info)| info)
    }

    /// Safe delete operation with retry (files and directories)
    pub async fn safe_delete(&self, path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::safe_delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(LibraryError::FileIoError(format!(
                        "Failed to delete after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    /// Try to delete once
    async fn safe_delete_once(path: &Path) -> Result<()> {
        // Not an error if it doesn't exist
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LibraryError::FileIoError(format!(
                "Delete failed: {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Check if file exists
    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(
            sanitize_file_name("AC/DC - Back in Black.mp3"),
            "AC_DC_-_Back_in_Black.mp3"
        );
        assert_eq!(sanitize_file_name("Björk - Jóga.mp3"), "Bj_rk_-_J_ga.mp3");
        assert_eq!(sanitize_file_name("plain-name.mp3"), "plain-name.mp3");
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_contents() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("nested").join("atomic.json");

        atomic_write(&file, b"first").await.unwrap();
        atomic_write(&file, b"second").await.unwrap();

        assert_eq!(fs::read_to_string(&file).await.unwrap(), "second");
        assert!(!temp_dir.path().join("nested").join(".atomic.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().join("docs").join("downloads"));
        assert!(dir.ensure_exists().await);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_ensure_exists_swallows_failure() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, b"x").await.unwrap();

        let dir = DownloadsDirectory::new(blocker.join("downloads"));
        assert!(!dir.ensure_exists().await);
    }

    #[tokio::test]
    async fn test_remove_item_files_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().to_path_buf());
        let track = dir.track_file_path("Artist", "Song");
        fs::write(&track, b"audio").await.unwrap();
        let playlist = dir.playlist_path("p9");
        fs::create_dir_all(&playlist).await.unwrap();
        fs::write(playlist.join("a.mp3"), b"audio").await.unwrap();

        assert_eq!(dir.remove_item_files(ItemKind::Track, "t1", Some(&track)).await.unwrap(), 1);
        assert_eq!(dir.remove_item_files(ItemKind::Playlist, "p9", None).await.unwrap(), 1);
        assert!(!track.exists());
        assert!(!playlist.exists());

        assert_eq!(dir.remove_item_files(ItemKind::Track, "t1", Some(&track)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_track_leaves_other_items_sharing_the_id() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().to_path_buf());
        let song = dir.track_file_path("A", "Song");
        let other = dir.track_file_path("B", "Track 1");
        let playlist = dir.playlist_path("1");
        let partial = temp_dir.path().join("A_-_Song.mp3.track_1_5.part");
        for path in [&song, &other, &partial] {
            fs::write(path, b"audio").await.unwrap();
        }
        fs::create_dir_all(&playlist).await.unwrap();

        assert_eq!(dir.remove_item_files(ItemKind::Track, "1", Some(&song)).await.unwrap(), 2);
        assert!(!song.exists());
        assert!(!partial.exists());
        assert!(other.exists());
        assert!(playlist.exists());
    }

    #[tokio::test]
    async fn test_remove_track_without_record_deletes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().to_path_buf());
        let other = dir.track_file_path("B", "Track 1");
        fs::write(&other, b"audio").await.unwrap();

        assert_eq!(dir.remove_item_files(ItemKind::Track, "1", None).await.unwrap(), 0);
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_remove_refuses_paths_outside_directory() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("keep.txt");
        fs::write(&outside, b"keep").await.unwrap();

        let dir = DownloadsDirectory::new(temp_dir.path().join("downloads"));
        dir.ensure_exists().await;
        assert_eq!(dir.remove_item_files(ItemKind::Track, "x", Some(&outside)).await.unwrap(), 0);
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_clear_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().join("downloads"));
        dir.ensure_exists().await;
        fs::write(dir.path().join("a.mp3"), vec![0u8; 10]).await.unwrap();
        let nested = dir.playlist_path("p1");
        fs::create_dir_all(&nested).await.unwrap();
        fs::write(nested.join("b.mp3"), vec![0u8; 5]).await.unwrap();

        assert_eq!(dir.downloaded_size().await, 15);
        assert_eq!(dir.clear().await.unwrap(), 2);
        assert_eq!(dir.downloaded_size().await, 0);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().join("never-created"));
        assert_eq!(dir.downloaded_size().await, 0);
        assert_eq!(dir.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_info_is_consistent() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadsDirectory::new(temp_dir.path().to_path_buf());
        let info = dir.storage_info().await;
        assert!(info.total >= info.available);
        assert_eq!(info.used, info.total - info.available);
    }
}
