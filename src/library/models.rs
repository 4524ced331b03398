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


//! Library entities and the store's state snapshot
//!
//! All records serialize camelCase so the mobile shell can hand them to
//! the UI layer unchanged.

use crate::download::models::{AudioQuality, DownloadJob};
use crate::download::registry::JobSource;
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A track as the library knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
    /// Media URL
    pub url: String,
    /// Seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_year: Option<u32>,
    /// Qualities the catalog offers
    #[serde(default)]
    pub quality: Vec<AudioQuality>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    /// Bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_size: Option<u64>,
}

impl LibraryTrack {
    /// Minimal catalog record, mostly for tests and the CLI
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>, url: impl Into<String>, duration: f64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: None,
            artwork: None,
            url: url.into(),
            duration,
            genre: None,
            release_year: None,
            quality: AudioQuality::ALL.to_vec(),
            is_premium: false,
            is_downloaded: false,
            downloaded_at: None,
            download_path: None,
            download_size: None,
        }
    }

    pub fn job_source(&self) -> JobSource {
        JobSource {
            item_id: self.id.clone(),
            title: self.title.clone(),
            artist: Some(self.artist.clone()),
            artwork: self.artwork.clone(),
            duration: self.duration,
        }
    }
}

/// Playlist flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistType {
    Album,
    Compilation,
    #[default]
    Curated,
    User,
    Generated,
}

/// A playlist as the library knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryPlaylist {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
    pub author: String,
    /// Seconds
    pub duration: f64,
    pub track_count: u32,
    #[serde(default)]
    pub genre: Vec<String>,
    #[serde(default)]
    pub mood: Vec<String>,
    #[serde(default)]
    pub purpose: Vec<String>,
    #[serde(rename = "type", default)]
    pub playlist_type: PlaylistType,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,
    /// 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_size: Option<u64>,
    /// Member tracks; when present they are fetched individually
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<LibraryTrack>,
}

impl LibraryPlaylist {
    pub fn new(id: impl Into<String>, title: impl Into<String>, author: impl Into<String>, duration: f64, track_count: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            artwork: None,
            author: author.into(),
            duration,
            track_count,
            genre: Vec::new(),
            mood: Vec::new(),
            purpose: Vec::new(),
            playlist_type: PlaylistType::default(),
            is_premium: false,
            is_downloaded: false,
            downloaded_at: None,
            download_progress: None,
            download_size: None,
            tracks: Vec::new(),
        }
    }

    /// Attach member tracks; duration and count follow the tracks
    pub fn with_tracks(mut self, tracks: Vec<LibraryTrack>) -> Self {
        self.duration = tracks.iter().map(|t| t.duration).sum();
        self.track_count = tracks.len() as u32;
        self.tracks = tracks;
        self
    }

    pub fn job_source(&self) -> JobSource {
        JobSource {
            item_id: self.id.clone(),
            title: self.title.clone(),
            artist: Some(self.author.clone()),
            artwork: self.artwork.clone(),
            duration: self.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikedTrack {
    pub id: String,
    pub track_id: String,
    pub track: LibraryTrack,
    pub liked_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikedPlaylist {
    pub id: String,
    pub playlist_id: String,
    pub playlist: LibraryPlaylist,
    pub liked_at: String,
}

/// Library screen tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryTab {
    #[default]
    Liked,
    Downloads,
    RecentlyPlayed,
    Created,
}

impl LibraryTab {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryTab::Liked => "liked",
            LibraryTab::Downloads => "downloads",
            LibraryTab::RecentlyPlayed => "recently_played",
            LibraryTab::Created => "created",
        }
    }
}

impl fmt::Display for LibraryTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibraryTab {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "liked" => Ok(LibraryTab::Liked),
            "downloads" => Ok(LibraryTab::Downloads),
            "recently_played" => Ok(LibraryTab::RecentlyPlayed),
            "created" => Ok(LibraryTab::Created),
            other => Err(LibraryError::invalid_input(format!("Invalid library tab: {}", other))),
        }
    }
}

/// Current network, as reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Wifi,
    Cellular,
    Offline,
}

/// Snapshot of everything the library screen renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryState {
    pub liked_tracks: Vec<LikedTrack>,
    pub liked_playlists: Vec<LikedPlaylist>,

    /// Most recent first
    pub downloaded_tracks: Vec<LibraryTrack>,
    pub downloaded_playlists: Vec<LibraryPlaylist>,
    /// Mirror of executor jobs, updated from events
    pub download_jobs: Vec<DownloadJob>,
    /// Bytes on disk under the downloads directory
    pub total_download_size: u64,

    pub is_offline_mode: bool,
    pub offline_quality: AudioQuality,
    /// Gigabytes
    pub max_download_size: u32,
    pub download_over_wifi_only: bool,

    pub is_loading: bool,
    pub is_refreshing: bool,
    pub error: Option<String>,
    pub selected_tab: LibraryTab,

    pub available_storage: u64,
    pub used_storage: u64,
    pub total_storage: u64,
}

/// Count for one artist or genre
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedName {
    pub name: String,
    pub count: u32,
}

/// Aggregate numbers for the library screen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryStats {
    pub total_liked_tracks: u32,
    pub total_liked_playlists: u32,
    pub total_downloaded_tracks: u32,
    pub total_downloaded_playlists: u32,
    pub total_download_size: u64,
    /// Seconds of downloaded audio
    pub total_download_duration: u64,
    pub top_genres: Vec<RankedName>,
    pub top_artists: Vec<RankedName>,
}

/// How many entries the top lists keep
pub const TOP_LIST_LEN: usize = 5;

impl LibraryStats {
    pub fn from_state(state: &LibraryState) -> Self {
        let downloaded = &state.downloaded_tracks;

        let mut artists: HashMap<&str, u32> = HashMap::new();
        let mut genres: HashMap<&str, u32> = HashMap::new();
        for track in downloaded {
            *artists.entry(track.artist.as_str()).or_default() += 1;
            if let Some(genre) = track.genre.as_deref() {
                *genres.entry(genre).or_default() += 1;
            }
        }

        Self {
            total_liked_tracks: state.liked_tracks.len() as u32,
            total_liked_playlists: state.liked_playlists.len() as u32,
            total_downloaded_tracks: downloaded.len() as u32,
            total_downloaded_playlists: state.downloaded_playlists.len() as u32,
            total_download_size: state.total_download_size,
            total_download_duration: downloaded.iter().map(|t| t.duration.max(0.0)).sum::<f64>().round() as u64,
            top_genres: rank(genres),
            top_artists: rank(artists),
        }
    }
}

/// Highest count first, ties by name
fn rank(counts: HashMap<&str, u32>) -> Vec<RankedName> {
    let mut ranked: Vec<RankedName> = counts
        .into_iter()
        .map(|(name, count)| RankedName {
            name: name.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(TOP_LIST_LEN);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlist_deserializes_without_tracks() {
        let json = r#"{
            "id": "p1", "title": "Focus", "author": "Editors", "duration": 1800,
            "trackCount": 10, "genre": ["ambient"], "mood": [], "purpose": ["focus"],
            "type": "curated", "isPremium": false, "isDownloaded": false
        }"#;
        let playlist: LibraryPlaylist = serde_json::from_str(json).unwrap();
        assert_eq!(playlist.playlist_type, PlaylistType::Curated);
        assert!(playlist.tracks.is_empty());
    }

    #[test]
    fn test_with_tracks_sums_duration() {
        let playlist = LibraryPlaylist::new("p1", "Mix", "me", 0.0, 0).with_tracks(vec![
            LibraryTrack::new("a", "A", "X", "https://cdn/a.mp3", 100.0),
            LibraryTrack::new("b", "B", "Y", "https://cdn/b.mp3", 50.0),
        ]);
        assert_eq!(playlist.duration, 150.0);
        assert_eq!(playlist.track_count, 2);
    }

    #[test]
    fn test_stats_rank_artists_and_genres() {
        let mut a = LibraryTrack::new("a", "A", "Nils", "https://cdn/a.mp3", 60.0);
        a.genre = Some("ambient".to_string());
        let mut b = LibraryTrack::new("b", "B", "Nils", "https://cdn/b.mp3", 30.0);
        b.genre = Some("ambient".to_string());
        let c = LibraryTrack::new("c", "C", "Ólafur", "https://cdn/c.mp3", 10.0);

        let state = LibraryState {
            downloaded_tracks: vec![a, b, c],
            total_download_size: 1234,
            ..Default::default()
        };
        let stats = LibraryStats::from_state(&state);

        assert_eq!(stats.total_downloaded_tracks, 3);
        assert_eq!(stats.total_download_duration, 100);
        assert_eq!(stats.top_artists[0], RankedName { name: "Nils".to_string(), count: 2 });
        assert_eq!(stats.top_genres.len(), 1);
    }

    #[test]
    fn test_tab_wire_names() {
        assert_eq!(serde_json::to_value(LibraryTab::RecentlyPlayed).unwrap(), "recently_played");
        assert_eq!("downloads".parse::<LibraryTab>().unwrap(), LibraryTab::Downloads);
    }
}
