//! Destination path derivation for downloaded tracks

use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_TRACK: &str = "Unknown Track";

/// Reduce a name to `[A-Za-z0-9 _-]`
///
/// Characters are decomposed (NFKD) first so accented letters keep their
/// ASCII base letter; anything without one is dropped.
pub fn normalize_component(name: &str) -> String {
    name.nfkd()
        .filter(|&c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn component_or(name: Option<&str>, fallback: &str) -> String {
    let normalized = normalize_component(name.unwrap_or_default());
    if normalized.is_empty() {
        fallback.to_string()
    } else {
        normalized
    }
}

/// Normalize a file name, keeping its extension after a single dot
fn normalize_file_name(file_name: &str) -> String {
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    let stem = component_or(Some(stem), UNKNOWN_TRACK);
    match extension.map(normalize_component) {
        Some(ext) if !ext.is_empty() => format!("{}.{}", stem, ext),
        _ => stem,
    }
}

/// Compute `(album_dir, file_path)` for a track
///
/// With `subfolders` the layout is `base/artist/album/file`, otherwise every
/// file lands directly in `base`. The result depends only on the inputs, so
/// repeated runs agree on where a track lives.
pub fn track_path(
    artist: Option<&str>,
    album: Option<&str>,
    file_name: &str,
    base_dir: &Path,
    subfolders: bool,
) -> (PathBuf, PathBuf) {
    let album_dir = if subfolders {
        base_dir
            .join(component_or(artist, UNKNOWN_ARTIST))
            .join(component_or(album, UNKNOWN_ALBUM))
    } else {
        base_dir.to_path_buf()
    };

    let file_path = album_dir.join(normalize_file_name(file_name));
    (album_dir, file_path)
}

/// Make a playlist title usable as a file name
///
/// Unlike track paths, titles keep their Unicode: only characters that are
/// unsafe on common filesystems are swapped for look-alikes.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' => '⧸',  // U+29F8 Big Solidus
            '\\' => '⧹', // U+29F9 Big Reverse Solidus
            ':' => '꞉',  // U+A789 Modifier Letter Colon
            '*' => '⁎',  // U+204E Low Asterisk
            '?' => '？', // U+FF1F Fullwidth Question Mark
            '"' => '″',  // U+2033 Double Prime
            '<' => '‹',
            '>' => '›',
            '|' => '｜',
            '\0' => '_',
            _ => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let base = Path::new("/music");
        let first = track_path(Some("Bjӧrk"), Some("Vespertine"), "01 Hidden Place.flac", base, true);
        let second = track_path(Some("Bjӧrk"), Some("Vespertine"), "01 Hidden Place.flac", base, true);
        assert_eq!(first, second);

        let relative = first.1.strip_prefix(base).unwrap();
        let components: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(components.len(), 3);
        assert!(allowed(&components[0]));
        assert!(allowed(&components[1]));
        let (stem, ext) = components[2].rsplit_once('.').unwrap();
        assert!(allowed(stem));
        assert_eq!(ext, "flac");
    }

    #[test]
    fn test_accents_decompose_to_ascii() {
        assert_eq!(normalize_component("Björk"), "Bjork");
        assert_eq!(normalize_component("Sigur Rós"), "Sigur Ros");
        assert_eq!(normalize_component("AC/DC: Live!"), "ACDC Live");
    }

    #[test]
    fn test_missing_metadata_uses_sentinels() {
        let (album_dir, path) = track_path(None, Some("坂本"), "曲.mp3", Path::new("/m"), true);
        assert_eq!(album_dir, Path::new("/m/Unknown Artist/Unknown Album"));
        assert_eq!(path, Path::new("/m/Unknown Artist/Unknown Album/Unknown Track.mp3"));
    }

    #[test]
    fn test_flat_layout() {
        let (album_dir, path) = track_path(Some("A"), Some("B"), "song.ogg", Path::new("/m"), false);
        assert_eq!(album_dir, Path::new("/m"));
        assert_eq!(path, Path::new("/m/song.ogg"));
    }

    #[test]
    fn test_file_without_extension() {
        let (_, path) = track_path(Some("A"), Some("B"), "README", Path::new("/m"), false);
        assert_eq!(path, Path::new("/m/README"));
    }

    #[test]
    fn test_sanitize_slashes() {
        assert_eq!(sanitize_filename("BOTHERED / UNBOTHERED"), "BOTHERED ⧸ UNBOTHERED");
        assert_eq!(sanitize_filename("  Chill: Mix  "), "Chill꞉ Mix");
    }
}
