//! Plex API response models

use serde::Deserialize;

use crate::media::{Playlist, Track};

/// Wrapper for Plex list responses
#[derive(Debug, Clone, Deserialize)]
pub struct PlexResponse<T> {
    #[serde(rename = "MediaContainer")]
    pub media_container: MediaContainer<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaContainer<T> {
    #[serde(rename = "friendlyName", default)]
    pub friendly_name: Option<String>,
    #[serde(rename = "machineIdentifier", default)]
    pub machine_identifier: Option<String>,
    #[serde(rename = "Metadata", default = "Vec::new")]
    pub metadata: Vec<T>,
}

/// Playlist from `/playlists`
#[derive(Debug, Clone, Deserialize)]
pub struct PlexPlaylist {
    #[serde(rename = "ratingKey")]
    pub rating_key: String,
    pub title: String,
    #[serde(rename = "playlistType", default)]
    pub playlist_type: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
}

impl From<PlexPlaylist> for Playlist {
    fn from(p: PlexPlaylist) -> Self {
        Playlist {
            id: p.rating_key,
            title: p.title,
            guid: p.guid,
        }
    }
}

/// Track from `/playlists/{id}/items`
#[derive(Debug, Clone, Deserialize)]
pub struct PlexTrack {
    #[serde(rename = "ratingKey")]
    pub rating_key: String,
    pub title: String,
    #[serde(rename = "grandparentTitle", default)]
    pub artist: Option<String>,
    #[serde(rename = "parentTitle", default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(rename = "Media", default)]
    pub media: Vec<PlexMedia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlexMedia {
    #[serde(rename = "Part", default)]
    pub parts: Vec<PlexPart>,
}

/// Part element: the actual file on the server
#[derive(Debug, Clone, Deserialize)]
pub struct PlexPart {
    pub key: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl PlexTrack {
    /// Convert to a [`Track`], using the first media part
    ///
    /// Returns `None` for items without a downloadable part.
    pub fn into_track(self) -> Option<Track> {
        let part = self.media.into_iter().flat_map(|m| m.parts).next()?;

        let remote_file_name = part
            .file
            .as_deref()
            .and_then(|f| f.rsplit(['/', '\\']).next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| part.key.rsplit('/').next().map(str::to_string))
            .unwrap_or_else(|| format!("{}.bin", self.rating_key));

        Some(Track {
            id: self.rating_key,
            title: self.title,
            artist: self.artist,
            album: self.album,
            duration_ms: self.duration.unwrap_or(0),
            size: part.size,
            remote_file_name,
            part_key: part.key,
        })
    }
}
