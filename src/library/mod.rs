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


//! The user's offline library: liked items, downloaded items, settings

pub mod models;
pub mod store;

// Re-export commonly used types
pub use models::{
    LibraryPlaylist, LibraryState, LibraryStats, LibraryTab, LibraryTrack, LikedPlaylist,
    LikedTrack, NetworkKind, PlaylistType,
};
pub use store::LibraryStore;
