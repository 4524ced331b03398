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


//! On-disk state of the offline library
//!
//! # Layout
//! ```text
//! <document dir>/
//!   downloads/
//!     Artist_-_Title.mp3
//!     playlist_<id>/          (per-track playlist downloads)
//!   library_metadata.json     (manifest)
//!   library_settings.json     (user preferences)
//! ```
//!
//! Removal order is files first, then the manifest entry, so a crash in
//! between leaves a manifest entry pointing at nothing (cleaned up by the
//! library store) rather than an untracked file.

pub mod files;
pub mod manifest;

// Re-export commonly used types
pub use files::{atomic_write, sanitize_file_name, DownloadsDirectory, StorageInfo};
pub use manifest::{Manifest, ManifestEntry, MetadataManifest};
