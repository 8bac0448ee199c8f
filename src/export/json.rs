//! JSON playlist export

use serde::Serialize;

use super::LocalTrackRecord;

#[derive(Debug, Serialize)]
struct JsonTrack<'a> {
    title: &'a str,
    artist: &'a str,
    album: &'a str,
    path: String,
    duration: u64,
}

/// Render a playlist's tracks as a pretty-printed JSON array
pub fn generate_json(tracks: &[&LocalTrackRecord]) -> serde_json::Result<String> {
    let entries: Vec<JsonTrack<'_>> = tracks
        .iter()
        .map(|t| JsonTrack {
            title: &t.title,
            artist: &t.artist,
            album: &t.album,
            path: t.path.to_string_lossy().into_owned(),
            duration: t.duration_secs,
        })
        .collect();

    serde_json::to_string_pretty(&entries)
}
