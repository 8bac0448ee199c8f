//! Application configuration persistence
//!
//! Stores paths, export preferences and playlist selection in
//! ~/.config/plexmix/config.json. The Plex token lives in the keyring, not here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::export::{ExportError, ExportFormat, ExportTargets, parse_formats};
use crate::media::Playlist;
use crate::sync::downloader::DEFAULT_THREADS;

/// Which server playlists the user has chosen to mirror or skip
///
/// Playlists are keyed by their server id (`ratingKey`), so a rename on the
/// server keeps the selection. The last title seen for each id is kept for
/// display and for locating exports written under an older title.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSelection {
    /// Playlist ids to download
    #[serde(default)]
    pub saved: Vec<String>,
    /// Playlist ids hidden from `list` prompts
    #[serde(default)]
    pub ignored: Vec<String>,
    /// Playlist id -> last known title
    #[serde(default)]
    pub titles: BTreeMap<String, String>,
}

impl PlaylistSelection {
    pub fn is_saved(&self, id: &str) -> bool {
        self.saved.iter().any(|s| s == id)
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored.iter().any(|s| s == id)
    }

    /// Mark a playlist for download, clearing any ignore
    pub fn save(&mut self, playlist: &Playlist) {
        self.ignored.retain(|s| s != &playlist.id);
        if !self.is_saved(&playlist.id) {
            self.saved.push(playlist.id.clone());
        }
        self.remember(playlist);
    }

    /// Ignore a playlist, dropping it from the saved set
    pub fn ignore(&mut self, playlist: &Playlist) {
        self.saved.retain(|s| s != &playlist.id);
        if !self.is_ignored(&playlist.id) {
            self.ignored.push(playlist.id.clone());
        }
        self.remember(playlist);
    }

    /// Last known title of a playlist id
    pub fn title_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.titles.get(id).map(String::as_str).unwrap_or(id)
    }

    fn remember(&mut self, playlist: &Playlist) {
        self.titles
            .insert(playlist.id.clone(), playlist.title.trim().to_string());
    }

    /// Record the server's current titles, returning the previous titles of
    /// selected playlists that were renamed
    pub fn refresh_titles(&mut self, playlists: &[Playlist]) -> Vec<String> {
        let mut renamed = Vec::new();
        for playlist in playlists {
            let title = playlist.title.trim();
            if let Some(previous) = self.titles.get_mut(&playlist.id) {
                if previous.as_str() != title {
                    debug!("Playlist {} renamed from {:?} to {:?}", playlist.id, previous, title);
                    renamed.push(std::mem::replace(previous, title.to_string()));
                }
            }
        }
        renamed
    }
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Plex server base URL, as last authenticated
    #[serde(default)]
    pub server_url: Option<String>,
    /// Root of the local track mirror
    pub library_path: PathBuf,
    /// Directory for m3u8/json playlist files
    pub playlists_path: PathBuf,
    /// Directory holding the iTunes library document
    #[serde(default)]
    pub itunes_path: Option<PathBuf>,
    /// Concurrent transfers
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Lay tracks out as artist/album/file
    #[serde(default = "default_subfolders")]
    pub subfolders: bool,
    /// Export formats used when none are given on the command line
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default)]
    pub playlists: PlaylistSelection,
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_subfolders() -> bool {
    true
}

fn default_formats() -> Vec<String> {
    vec![ExportFormat::M3u8.to_string()]
}

impl Default for AppConfig {
    fn default() -> Self {
        let library_path = dirs::audio_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plexmix");
        Self::with_library(library_path)
    }
}

impl AppConfig {
    /// Defaults rooted at the given library directory
    pub fn with_library(library_path: PathBuf) -> Self {
        Self {
            server_url: None,
            playlists_path: library_path.join("playlists"),
            library_path,
            itunes_path: None,
            threads: DEFAULT_THREADS,
            subfolders: true,
            formats: default_formats(),
            playlists: PlaylistSelection::default(),
        }
    }

    /// Load the config from its default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save the config to its default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let config: Self =
            serde_json::from_str(&contents).with_context(|| "Failed to parse config")?;

        debug!(
            "Loaded config with {} saved playlists",
            config.playlists.saved.len()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("plexmix").join("config.json"))
    }

    /// Directory the iTunes library document is written to
    pub fn itunes_dir(&self) -> &Path {
        self.itunes_path.as_deref().unwrap_or(&self.playlists_path)
    }

    /// Configured formats, with unknown names reported separately
    pub fn export_formats(&self) -> (Vec<ExportFormat>, Vec<ExportError>) {
        parse_formats(&self.formats)
    }

    pub fn export_targets(&self) -> ExportTargets {
        ExportTargets {
            playlists_dir: self.playlists_path.clone(),
            itunes_dir: Some(self.itunes_dir().to_path_buf()),
            music_folder: self.library_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::playlist;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.threads, 4);
        assert!(config.subfolders);
        assert_eq!(config.formats, vec!["m3u8".to_string()]);
        assert!(config.library_path.ends_with("plexmix"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::with_library(dir.path().join("music"));
        config.server_url = Some("http://plex.local:32400".to_string());
        config.formats = vec!["m3u8".to_string(), "itunes".to_string()];
        config.playlists.save(&playlist("12", "Road Trip"));
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.itunes_dir(), dir.path().join("music").join("playlists"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"library_path": "/srv/music", "playlists_path": "/srv/music/lists"}"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.threads, DEFAULT_THREADS);
        assert!(config.subfolders);
        assert!(config.playlists.saved.is_empty());
    }

    #[test]
    fn test_selection_save_and_ignore_are_exclusive() {
        let chill = playlist("31", "Chill");
        let mut selection = PlaylistSelection::default();
        selection.save(&chill);
        selection.save(&chill);
        assert_eq!(selection.saved, vec!["31".to_string()]);

        selection.ignore(&chill);
        assert!(!selection.is_saved("31"));
        assert!(selection.is_ignored("31"));

        selection.save(&chill);
        assert!(selection.is_saved("31"));
        assert!(!selection.is_ignored("31"));
    }

    #[test]
    fn test_selection_survives_rename_and_same_titles() {
        let mut selection = PlaylistSelection::default();
        selection.save(&playlist("31", "Chill"));
        selection.ignore(&playlist("32", "Chill"));

        let renamed = selection.refresh_titles(&[
            playlist("31", "Chill Evenings"),
            playlist("32", "Chill"),
        ]);

        assert_eq!(renamed, ["Chill"]);
        assert!(selection.is_saved("31"));
        assert!(!selection.is_saved("32"));
        assert_eq!(selection.title_of("31"), "Chill Evenings");
        assert_eq!(selection.title_of("99"), "99");
    }

    #[test]
    fn test_unknown_format_reported() {
        let mut config = AppConfig::with_library(PathBuf::from("/music"));
        config.formats = vec!["json".to_string(), "wpl".to_string()];
        let (formats, errors) = config.export_formats();
        assert_eq!(formats, vec![ExportFormat::Json]);
        assert_eq!(errors.len(), 1);
    }
}
