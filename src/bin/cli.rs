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


use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use library_core::download::models::{AudioQuality, DownloadStatus, ItemKind};
use library_core::download::progress;
use library_core::library::LibraryTrack;
use library_core::{DownloadConfig, LibraryStore};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "library-cli")]
#[command(about = "Offline library CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Document directory holding downloads and the manifest
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one track into the library
    Track {
        /// Media URL
        url: String,
        /// Track id recorded in the manifest
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        /// Duration in seconds (drives the size estimate)
        #[arg(long, default_value_t = 0.0)]
        duration: f64,
        /// low, medium, high or lossless
        #[arg(short, long)]
        quality: Option<AudioQuality>,
    },
    /// List downloaded items
    List,
    /// Remove a downloaded item
    Remove {
        item_id: String,
        /// track or playlist
        #[arg(long, default_value = "track")]
        kind: ItemKind,
    },
    /// Delete every download
    Clear,
    /// Show disk capacity and library size
    Storage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = LibraryStore::open(DownloadConfig::new(&cli.dir))
        .await
        .with_context(|| format!("Failed to open library in {}", cli.dir.display()))?;

    match cli.command {
        Commands::Track {
            url,
            id,
            title,
            artist,
            duration,
            quality,
        } => {
            let track = LibraryTrack::new(id, title, artist, url, duration);
            let Some(download_id) = store.download_track(&track, quality) else {
                bail!(store.error().unwrap_or_else(|| "Download did not start".to_string()));
            };

            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let job = store
                    .executor()
                    .get_job(&download_id)
                    .context("Download disappeared")?;
                println!("{}", progress::display_string(&job));
                match job.status {
                    DownloadStatus::Completed => break,
                    DownloadStatus::Failed | DownloadStatus::Cancelled => {
                        bail!(job.error.unwrap_or_else(|| job.status.to_string()))
                    }
                    _ => {}
                }
            }
        }
        Commands::List => {
            store.load_downloads().await;
            let state = store.snapshot();
            for track in &state.downloaded_tracks {
                println!(
                    "track     {:<24} {:>10}  {}",
                    track.id,
                    progress::bytes_string(track.download_size.unwrap_or(0)),
                    track.download_path.as_deref().unwrap_or("")
                );
            }
            for playlist in &state.downloaded_playlists {
                println!(
                    "playlist  {:<24} {:>10}  {}",
                    playlist.id,
                    progress::bytes_string(playlist.download_size.unwrap_or(0)),
                    playlist.title
                );
            }
            println!("Total: {}", progress::bytes_string(state.total_download_size));
        }
        Commands::Remove { item_id, kind } => {
            store.remove_download(&item_id, kind).await;
            if let Some(error) = store.error() {
                bail!(error);
            }
            println!("Removed {} {}", kind, item_id);
        }
        Commands::Clear => {
            store.clear_all_downloads().await;
            if let Some(error) = store.error() {
                bail!(error);
            }
            println!("Cleared all downloads");
        }
        Commands::Storage => {
            store.refresh().await;
            let state = store.snapshot();
            println!("Available: {}", progress::bytes_string(state.available_storage));
            println!("Used:      {}", progress::bytes_string(state.used_storage));
            println!("Total:     {}", progress::bytes_string(state.total_storage));
            println!("Library:   {}", progress::bytes_string(state.total_download_size));
        }
    }

    store.shutdown().await;
    Ok(())
}
