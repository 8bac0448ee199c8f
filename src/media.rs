//! Media server abstraction consumed by the download pipeline

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An audio track as reported by the media server
///
/// Owned by the server; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    /// Grandparent title on Plex
    pub artist: Option<String>,
    /// Parent title on Plex
    pub album: Option<String>,
    pub duration_ms: u64,
    /// Size of the server-side file in bytes, when reported
    pub size: Option<u64>,
    /// Basename of the server-side file
    pub remote_file_name: String,
    /// Server path the bytes are transferred from
    pub part_key: String,
}

impl Track {
    pub fn duration_secs(&self) -> u64 {
        self.duration_ms / 1000
    }
}

/// Playlist metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub guid: Option<String>,
}

/// Operations the pipeline needs from a media server
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// List every audio playlist on the server
    async fn list_audio_playlists(&self) -> Result<Vec<Playlist>>;

    /// Tracks of a playlist, in playlist order
    async fn playlist_items(&self, playlist: &Playlist) -> Result<Vec<Track>>;

    /// Transfer a track's bytes into `dest_dir`
    ///
    /// The file name chosen on disk is up to the server, callers must not
    /// assume it matches any prediction.
    async fn download(&self, track: &Track, dest_dir: &Path) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory media client for tests

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn track(id: &str, title: &str, size: u64) -> Track {
        Track {
            id: id.to_string(),
            title: title.to_string(),
            artist: Some("Artist".to_string()),
            album: Some("Album".to_string()),
            duration_ms: 185_000,
            size: Some(size),
            remote_file_name: format!("{} {}.flac", id, title),
            part_key: format!("/library/parts/{}/file.flac", id),
        }
    }

    pub fn playlist(id: &str, title: &str) -> Playlist {
        Playlist {
            id: id.to_string(),
            title: title.to_string(),
            guid: None,
        }
    }

    /// Writes `track.size` bytes under the remote file name (or an override)
    #[derive(Default)]
    pub struct FakeClient {
        pub playlists: Vec<(Playlist, Vec<Track>)>,
        pub failing: HashSet<String>,
        /// Track id -> file name the "server" saves under
        pub renamed: HashMap<String, String>,
        pub downloads: AtomicUsize,
        pub downloaded_ids: Mutex<Vec<String>>,
    }

    impl FakeClient {
        pub fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaClient for FakeClient {
        async fn list_audio_playlists(&self) -> Result<Vec<Playlist>> {
            Ok(self.playlists.iter().map(|(p, _)| p.clone()).collect())
        }

        async fn playlist_items(&self, playlist: &Playlist) -> Result<Vec<Track>> {
            self.playlists
                .iter()
                .find(|(p, _)| p.id == playlist.id)
                .map(|(_, tracks)| tracks.clone())
                .ok_or_else(|| anyhow::anyhow!("Playlist not found"))
        }

        async fn download(&self, track: &Track, dest_dir: &Path) -> Result<()> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.downloaded_ids
                .lock()
                .map_err(|_| anyhow::anyhow!("lock poisoned"))?
                .push(track.id.clone());

            if self.failing.contains(&track.id) {
                anyhow::bail!("connection reset while fetching {}", track.id);
            }

            let name = self
                .renamed
                .get(&track.id)
                .cloned()
                .unwrap_or_else(|| track.remote_file_name.clone());
            let data = vec![0u8; track.size.unwrap_or(16) as usize];
            tokio::fs::write(dest_dir.join(name), data).await?;
            Ok(())
        }
    }
}
