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


//! JSON sidecar recording what has been downloaded
//!
//! ```json
//! { "downloads": { "<itemId>": { "id": "...", "type": "track", "filePath": "...",
//!                                "downloadedAt": "...", "size": 123, "quality": "high" } } }
//! ```
//!
//! Every mutation is a read-modify-write under one async mutex, and the file
//! is replaced atomically, so concurrent completions never drop entries.
//! A missing, unreadable or malformed file reads as an empty manifest.

use crate::download::models::{AudioQuality, ItemKind};
use crate::error::{LibraryError, Result};
use crate::storage::files::atomic_write;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// One downloaded item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub file_path: String,
    pub downloaded_at: String,
    pub size: u64,
    pub quality: AudioQuality,
}

/// On-disk manifest document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub downloads: BTreeMap<String, ManifestEntry>,
}

/// Serialized access to the manifest file
#[derive(Debug)]
pub struct MetadataManifest {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetadataManifest {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest, degrading to empty on any failure
    pub async fn load(&self) -> Manifest {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    /// Add or replace the entry for `item_id`
    pub async fn record(&self, item_id: &str, entry: ManifestEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read_unlocked().await;
        manifest.downloads.insert(item_id.to_string(), entry);
        self.write_unlocked(&manifest).await
    }

    /// Drop the entry for `item_id`, returning it if present
    pub async fn remove(&self, item_id: &str) -> Result<Option<ManifestEntry>> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read_unlocked().await;
        let removed = manifest.downloads.remove(item_id);
        if removed.is_some() {
            self.write_unlocked(&manifest).await?;
        }
        Ok(removed)
    }

    /// Drop every entry for which `keep` returns false
    pub async fn retain<F>(&self, mut keep: F) -> Result<Vec<String>>
    where
        F: FnMut(&str, &ManifestEntry) -> bool,
    {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read_unlocked().await;
        let mut dropped = Vec::new();
        manifest.downloads.retain(|item_id, entry| {
            let kept = keep(item_id, entry);
            if !kept {
                dropped.push(item_id.clone());
            }
            kept
        });
        if !dropped.is_empty() {
            self.write_unlocked(&manifest).await?;
        }
        Ok(dropped)
    }

    /// Reset the file to `{}`
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_unlocked(&Manifest::default()).await
    }

    pub async fn get(&self, item_id: &str) -> Option<ManifestEntry> {
        self.load().await.downloads.remove(item_id)
    }

    /// All entries ordered by item id
    pub async fn entries(&self) -> Vec<(String, ManifestEntry)> {
        self.load().await.downloads.into_iter().collect()
    }

    async fn read_unlocked(&self) -> Manifest {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}", self.path.display());
                return Manifest::default();
            }
            Err(e) => {
                warn!("Failed to read manifest {}: {}", self.path.display(), e);
                return Manifest::default();
            }
        };

        if contents.trim().is_empty() {
            return Manifest::default();
        }

        match serde_json::from_str::<Manifest>(&contents) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(
                    "Manifest {} is corrupt, starting empty: {}",
                    self.path.display(),
                    e
                );
                Manifest::default()
            }
        }
    }

    async fn write_unlocked(&self, manifest: &Manifest) -> Result<()> {
        let data = serde_json::to_vec(manifest)?;
        atomic_write(&self.path, &data).await.map_err(|e| {
            LibraryError::ManifestError(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}
