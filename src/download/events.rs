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


//! Per-job callback registries
//!
//! One callback per job id per event kind; registering again replaces the
//! previous one. Completion and failure are the last events a job emits, so
//! all three registries are cleared for that id right after either fires.
//! Callbacks run outside the registry lock and may re-register freely.

use crate::download::models::{DownloadCompletedEvent, DownloadFailedEvent, DownloadProgressEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(DownloadProgressEvent) + Send + Sync>;

/// Callback type for completion
pub type CompletedCallback = Arc<dyn Fn(DownloadCompletedEvent) + Send + Sync>;

/// Callback type for failures
pub type FailedCallback = Arc<dyn Fn(DownloadFailedEvent) + Send + Sync>;

/// Listener set registered together when a download starts
#[derive(Clone, Default)]
pub struct DownloadListeners {
    pub on_progress: Option<ProgressCallback>,
    pub on_completed: Option<CompletedCallback>,
    pub on_failed: Option<FailedCallback>,
}

impl DownloadListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, f: impl Fn(DownloadProgressEvent) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn completed(mut self, f: impl Fn(DownloadCompletedEvent) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(f));
        self
    }

    pub fn failed(mut self, f: impl Fn(DownloadFailedEvent) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Arc::new(f));
        self
    }
}

/// Three independent callback maps keyed by job id
#[derive(Default)]
pub struct EventDispatcher {
    progress: RwLock<HashMap<String, ProgressCallback>>,
    completed: RwLock<HashMap<String, CompletedCallback>>,
    failed: RwLock<HashMap<String, FailedCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(&self, download_id: &str, callback: ProgressCallback) {
        self.progress.write().insert(download_id.to_string(), callback);
    }

    pub fn on_completed(&self, download_id: &str, callback: CompletedCallback) {
        self.completed.write().insert(download_id.to_string(), callback);
    }

    pub fn on_failed(&self, download_id: &str, callback: FailedCallback) {
        self.failed.write().insert(download_id.to_string(), callback);
    }

    /// Register whichever callbacks the set carries
    pub fn register(&self, download_id: &str, listeners: DownloadListeners) {
        if let Some(cb) = listeners.on_progress {
            self.on_progress(download_id, cb);
        }
        if let Some(cb) = listeners.on_completed {
            self.on_completed(download_id, cb);
        }
        if let Some(cb) = listeners.on_failed {
            self.on_failed(download_id, cb);
        }
    }

    /// Clear all three registries for a job
    pub fn remove_listener(&self, download_id: &str) {
        self.progress.write().remove(download_id);
        self.completed.write().remove(download_id);
        self.failed.write().remove(download_id);
    }

    pub fn notify_progress(&self, event: DownloadProgressEvent) {
        let callback = self.progress.read().get(&event.download_id).cloned();
        if let Some(cb) = callback {
            cb(event);
        }
    }

    pub fn notify_completed(&self, event: DownloadCompletedEvent) {
        let download_id = event.download_id.clone();
        let callback = self.completed.read().get(&download_id).cloned();
        self.remove_listener(&download_id);
        if let Some(cb) = callback {
            cb(event);
        }
    }

    pub fn notify_failed(&self, event: DownloadFailedEvent) {
        let download_id = event.download_id.clone();
        let callback = self.failed.read().get(&download_id).cloned();
        self.remove_listener(&download_id);
        if let Some(cb) = callback {
            cb(event);
        }
    }

    /// Whether any callback is registered for a job
    pub fn has_listeners(&self, download_id: &str) -> bool {
        self.progress.read().contains_key(download_id)
            || self.completed.read().contains_key(download_id)
            || self.failed.read().contains_key(download_id)
    }

    /// Number of job ids with at least one registered callback
    pub fn listener_count(&self) -> usize {
        let mut ids: Vec<String> = self.progress.read().keys().cloned().collect();
        ids.extend(self.completed.read().keys().cloned());
        ids.extend(self.failed.read().keys().cloned());
        ids.sort();
        ids.dedup();
        ids.len()
    }
}
