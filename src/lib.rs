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


//! Offline library core
//!
//! Downloads tracks and playlists for offline playback, tracks the jobs,
//! and keeps the on-disk library and its manifest in sync.
//!
//! # Modules
//! - [`download`]: jobs, transfers, executor
//! - [`storage`]: downloads directory and metadata manifest
//! - [`library`]: liked/downloaded items and the library store
//! - [`config`]: engine configuration and user settings
//! - [`ffi`]: exports for the mobile shell

uniffi::setup_scaffolding!();

pub mod config;
pub mod download;
pub mod error;
pub mod ffi;
pub mod library;
pub mod storage;

pub use config::{DownloadConfig, LibrarySettings};
pub use error::{LibraryError, Result};
pub use library::LibraryStore;
