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


//! In-memory registry of download jobs
//!
//! Jobs live for the lifetime of the process only; the manifest is the
//! durable record of what is on disk. Listing preserves creation order.

use crate::download::models::{AudioQuality, DownloadJob, DownloadStatus, ItemKind};
use crate::error::{LibraryError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Catalog fields snapshotted into a new job
#[derive(Debug, Clone)]
pub struct JobSource {
    pub item_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub artwork: Option<String>,
    /// Seconds of audio, drives the size estimate
    pub duration: f64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    jobs: HashMap<String, DownloadJob>,
    order: Vec<String>,
    /// Every id ever handed out, including removed jobs
    issued: HashSet<String>,
}

/// Keyed collection of download jobs
#[derive(Debug, Default)]
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new pending job
    ///
    /// Ids embed the creation time in milliseconds; a collision within the
    /// same millisecond bumps the timestamp so ids are never reused.
    pub fn create_job(&self, kind: ItemKind, source: &JobSource, quality: AudioQuality) -> DownloadJob {
        let now = chrono::Utc::now();
        let mut inner = self.inner.write();

        let mut stamp = now.timestamp_millis();
        let mut id = DownloadJob::make_id(kind, &source.item_id, stamp);
        while inner.issued.contains(&id) {
            stamp += 1;
            id = DownloadJob::make_id(kind, &source.item_id, stamp);
        }

        let job = DownloadJob {
            id: id.clone(),
            kind,
            item_id: source.item_id.clone(),
            title: source.title.clone(),
            artist: source.artist.clone(),
            artwork: source.artwork.clone(),
            status: DownloadStatus::Pending,
            progress: 0,
            total_size: quality.estimated_file_size(source.duration),
            downloaded_size: 0,
            speed: None,
            estimated_time_remaining: None,
            started_at: now.to_rfc3339(),
            completed_at: None,
            error: None,
            quality,
        };

        inner.issued.insert(id.clone());
        inner.order.push(id.clone());
        inner.jobs.insert(id, job.clone());
        job
    }

    /// Get a snapshot of a job
    pub fn get_job(&self, id: &str) -> Option<DownloadJob> {
        self.inner.read().jobs.get(id).cloned()
    }

    /// All jobs in creation order
    pub fn list_jobs(&self) -> Vec<DownloadJob> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Mutate a job in place and return the result of `f`
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut DownloadJob) -> R) -> Result<R> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| LibraryError::job_not_found(id))?;
        Ok(f(job))
    }

    /// Current status of a job
    pub fn status(&self, id: &str) -> Option<DownloadStatus> {
        self.inner.read().jobs.get(id).map(|job| job.status)
    }

    /// Drop a job record
    pub fn remove(&self, id: &str) -> Option<DownloadJob> {
        let mut inner = self.inner.write();
        inner.order.retain(|existing| existing != id);
        inner.jobs.remove(id)
    }

    /// Drop every job record
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.jobs.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
