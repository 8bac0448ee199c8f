//! Plex Media Server HTTP client

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, header};
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use super::models::*;
use crate::media::{MediaClient, Playlist, Track};

const TOKEN_HEADER: &str = "X-Plex-Token";

/// HTTP client for the Plex REST API
#[derive(Clone)]
pub struct PlexClient {
    base_url: Url,
    token: String,
    http_client: Client,
}

impl PlexClient {
    /// Create a new Plex client
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid server URL: {}", base_url))?;

        let http_client = Client::builder()
            .user_agent(concat!("plexmix/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url,
            token: token.to_string(),
            http_client,
        })
    }

    /// Resolve a server path (which may carry its own query) against the base URL
    fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid server path: {}", path))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
        debug!("Fetching {} from: {}", what, url);

        let response = self
            .http_client
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", what))?;

        if !response.status().is_success() {
            anyhow::bail!("Plex returned {} while fetching {}", response.status(), what);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// Test connection and credentials, returning the server's friendly name
    pub async fn ping(&self) -> Result<String> {
        let url = self.build_url("/identity")?;
        let response: PlexResponse<serde_json::Value> = self.get_json(url, "identity").await?;

        Ok(response
            .media_container
            .friendly_name
            .or(response.media_container.machine_identifier)
            .unwrap_or_else(|| self.base_url.to_string()))
    }
}

/// File name from a `Content-Disposition` header, if any
fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"'))
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

#[async_trait]
impl MediaClient for PlexClient {
    async fn list_audio_playlists(&self) -> Result<Vec<Playlist>> {
        let url = self.build_url("/playlists?playlistType=audio")?;
        let response: PlexResponse<PlexPlaylist> = self.get_json(url, "playlists").await?;

        let playlists: Vec<Playlist> = response
            .media_container
            .metadata
            .into_iter()
            .filter(|p| p.playlist_type.as_deref().is_none_or(|t| t == "audio"))
            .map(Playlist::from)
            .collect();

        debug!("Found {} playlists", playlists.len());
        Ok(playlists)
    }

    async fn playlist_items(&self, playlist: &Playlist) -> Result<Vec<Track>> {
        let url = self.build_url(&format!("/playlists/{}/items", playlist.id))?;
        let response: PlexResponse<PlexTrack> = self.get_json(url, "playlist items").await?;

        let total = response.media_container.metadata.len();
        let tracks: Vec<Track> = response
            .media_container
            .metadata
            .into_iter()
            .filter_map(PlexTrack::into_track)
            .collect();

        if tracks.len() < total {
            debug!(
                "Skipped {} items without media in {}",
                total - tracks.len(),
                playlist.title
            );
        }
        Ok(tracks)
    }

    async fn download(&self, track: &Track, dest_dir: &Path) -> Result<()> {
        let mut url = self.build_url(&track.part_key)?;
        url.query_pairs_mut().append_pair("download", "1");
        debug!("Downloading track {}: {}", track.id, url);

        let response = self
            .http_client
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .context("Failed to download track")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed (status {})", response.status());
        }

        let file_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| track.remote_file_name.clone());
        let dest = dest_dir.join(file_name);

        let mut file = tokio::fs::File::create(&dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read download response")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
        }
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_keeps_part_query() {
        let client = PlexClient::new("http://plex.local:32400/", "token").unwrap();
        let url = client.build_url("/playlists?playlistType=audio").unwrap();
        assert_eq!(url.as_str(), "http://plex.local:32400/playlists?playlistType=audio");
    }

    #[test]
    fn test_invalid_server_url() {
        assert!(PlexClient::new("not a url", "token").is_err());
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename("attachment; filename=\"01 Song.flac\"").as_deref(),
            Some("01 Song.flac")
        );
        assert_eq!(
            disposition_filename("attachment; filename=../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(disposition_filename("inline"), None);
    }
}
