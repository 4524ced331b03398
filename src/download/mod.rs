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


//! Download jobs and their execution
//!
//! - `models`: job records, statuses, qualities, events
//! - `registry`: in-memory job collection
//! - `events`: per-job callbacks
//! - `progress`: percentage, speed and ETA math
//! - `transfer`: resumable HTTP transfers
//! - `executor`: state machine and workers

pub mod events;
pub mod executor;
pub mod models;
pub mod progress;
pub mod registry;
pub mod transfer;

// Re-export commonly used types
pub use events::{DownloadListeners, EventDispatcher};
pub use executor::DownloadExecutor;
pub use models::{
    AudioQuality, DownloadCompletedEvent, DownloadFailedEvent, DownloadJob, DownloadProgressEvent,
    DownloadStatus, ItemKind,
};
pub use progress::ProgressTracker;
pub use registry::{JobRegistry, JobSource};
pub use transfer::{HttpTransfer, TransferBackend, TransferOutcome, TransferRequest};
