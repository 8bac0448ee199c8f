//! M3U8 playlist generation

use super::LocalTrackRecord;
use crate::library::UNKNOWN_ARTIST;

/// Generate an extended M3U playlist
///
/// Entries carry absolute paths, so the file works from any directory.
pub fn generate_m3u8(tracks: &[&LocalTrackRecord]) -> String {
    let mut content = String::from("#EXTM3U\n");
    for track in tracks {
        let display = if track.artist.is_empty() || track.artist == UNKNOWN_ARTIST {
            track.title.clone()
        } else {
            format!("{} - {}", track.artist, track.title)
        };
        content.push_str(&format!("#EXTINF:{},{}\n", track.duration_secs, display));
        content.push_str(&track.path.to_string_lossy());
        content.push('\n');
    }
    content
}
