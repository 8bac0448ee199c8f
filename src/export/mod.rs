//! Playlist registry and export formats
//!
//! Playlists are registered as their downloads finish; `proceed` then writes
//! every requested format from one consistent snapshot of the registry.

pub mod itunes;
mod json;
mod m3u;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::library::{UNKNOWN_ALBUM, UNKNOWN_ARTIST, sanitize_filename};
use crate::media::Playlist;
use crate::sync::downloader::FetchOutcome;
use itunes::{ItunesLibrary, LIBRARY_FILE};

pub use json::generate_json;
pub use m3u::generate_m3u8;

/// Errors that stop a single export format
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown export format: {0}")]
    UnknownFormat(String),

    #[error("iTunes export requires a library path")]
    MissingLibraryPath,

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize playlist: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ExportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    M3u8,
    Json,
    Itunes,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m3u8" | "m3u" => Ok(Self::M3u8),
            "json" => Ok(Self::Json),
            "itunes" | "xml" => Ok(Self::Itunes),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::M3u8 => "m3u8",
            Self::Json => "json",
            Self::Itunes => "itunes",
        };
        f.write_str(name)
    }
}

/// Parse format names, keeping the valid ones and the errors separately
pub fn parse_formats<S: AsRef<str>>(names: &[S]) -> (Vec<ExportFormat>, Vec<ExportError>) {
    let mut formats = Vec::new();
    let mut errors = Vec::new();
    for name in names {
        match name.as_ref().parse::<ExportFormat>() {
            Ok(format) if !formats.contains(&format) => formats.push(format),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }
    (formats, errors)
}

/// A track that is available locally
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTrackRecord {
    pub track_id: String,
    pub path: PathBuf,
    pub album_dir: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_secs: u64,
}

/// A playlist known to the registry, with its full track order
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredPlaylist {
    pub id: String,
    pub title: String,
    /// Server guid, stable across renames
    pub guid: Option<String>,
    pub track_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Registry {
    ids: HashSet<String>,
    playlists: Vec<RegisteredPlaylist>,
    tracks: HashMap<String, LocalTrackRecord>,
}

/// Read-only copy of the registry taken for one export
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub playlists: Vec<RegisteredPlaylist>,
    pub tracks: HashMap<String, LocalTrackRecord>,
}

impl RegistrySnapshot {
    /// Locally available tracks of `playlist`, in playlist order
    pub fn records<'a>(&'a self, playlist: &RegisteredPlaylist) -> Vec<&'a LocalTrackRecord> {
        playlist
            .track_ids
            .iter()
            .filter_map(|id| self.tracks.get(id))
            .collect()
    }
}

/// Where exports are written
#[derive(Debug, Clone)]
pub struct ExportTargets {
    pub playlists_dir: PathBuf,
    /// Directory holding the shared iTunes library
    pub itunes_dir: Option<PathBuf>,
    /// Library root recorded in a new iTunes library
    pub music_folder: PathBuf,
}

/// Result of one format in a `proceed` call
#[derive(Debug)]
pub struct FormatResult {
    pub format: ExportFormat,
    pub result: Result<Vec<PathBuf>, ExportError>,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub formats: Vec<FormatResult>,
}

impl ExportReport {
    pub fn failures(&self) -> impl Iterator<Item = (&ExportFormat, &ExportError)> {
        self.formats
            .iter()
            .filter_map(|f| f.result.as_ref().err().map(|e| (&f.format, e)))
    }
}

/// Accumulates downloaded playlists and writes them out
pub struct Exporter {
    targets: ExportTargets,
    registry: Mutex<Registry>,
    /// Held for the whole of `proceed` so concurrent exports don't interleave writes
    write_lock: tokio::sync::Mutex<()>,
}

impl Exporter {
    pub fn new(targets: ExportTargets) -> Self {
        Self {
            targets,
            registry: Mutex::new(Registry::default()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record a playlist and its fetched tracks
    ///
    /// Returns `false` without changing anything when the playlist was
    /// already registered. Tracks shared with other playlists are stored once.
    pub fn register(&self, playlist: &Playlist, outcomes: &[FetchOutcome]) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        if !registry.ids.insert(playlist.id.clone()) {
            debug!("Playlist already registered: {}", playlist.title);
            return false;
        }

        let mut track_ids = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let track = &outcome.track;
            track_ids.push(track.id.clone());

            let Ok(path) = &outcome.result else {
                continue;
            };
            registry
                .tracks
                .entry(track.id.clone())
                .or_insert_with(|| LocalTrackRecord {
                    track_id: track.id.clone(),
                    path: path.clone(),
                    album_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                    title: track.title.clone(),
                    artist: track
                        .artist
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
                    album: track
                        .album
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_ALBUM.to_string()),
                    duration_secs: track.duration_secs(),
                });
        }

        registry.playlists.push(RegisteredPlaylist {
            id: playlist.id.clone(),
            title: playlist.title.trim().to_string(),
            guid: playlist.guid.clone(),
            track_ids,
        });
        true
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            playlists: registry.playlists.clone(),
            tracks: registry.tracks.clone(),
        }
    }

    /// Write every requested format from the current registry contents
    ///
    /// A failing format does not prevent the others from being written.
    pub async fn proceed(&self, formats: &[ExportFormat]) -> ExportReport {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot();
        let mut report = ExportReport::default();

        for format in formats {
            let result = match format {
                ExportFormat::M3u8 => {
                    self.write_each(&snapshot, "m3u8", |records| Ok(generate_m3u8(records)))
                        .await
                }
                ExportFormat::Json => {
                    self.write_each(&snapshot, "json", |records| {
                        generate_json(records).map_err(ExportError::from)
                    })
                    .await
                }
                ExportFormat::Itunes => self.merge_itunes(&snapshot).await,
            };

            match &result {
                Ok(paths) => info!("Exported {} ({} files)", format, paths.len()),
                Err(e) => error!("Export to {} failed: {}", format, e),
            }
            report.formats.push(FormatResult {
                format: *format,
                result,
            });
        }

        report
    }

    /// One file per registered playlist, overwritten on every call
    ///
    /// When two titles map to the same file name the first playlist keeps
    /// the file and the later one is skipped with a warning.
    async fn write_each<F>(
        &self,
        snapshot: &RegistrySnapshot,
        extension: &str,
        render: F,
    ) -> Result<Vec<PathBuf>, ExportError>
    where
        F: Fn(&[&LocalTrackRecord]) -> Result<String, ExportError>,
    {
        let dir = &self.targets.playlists_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ExportError::io(dir, e))?;

        let mut written = Vec::with_capacity(snapshot.playlists.len());
        let mut owners: HashMap<PathBuf, &str> = HashMap::new();
        for playlist in &snapshot.playlists {
            let path = dir.join(format!("{}.{}", sanitize_filename(&playlist.title), extension));
            if let Some(owner) = owners.get(&path) {
                warn!(
                    "Playlist {:?} would overwrite {} written for {:?}, skipping",
                    playlist.title,
                    path.display(),
                    owner
                );
                continue;
            }
            owners.insert(path.clone(), &playlist.title);

            let records = snapshot.records(playlist);
            let content = render(&records)?;

            fs::write(&path, content)
                .await
                .map_err(|e| ExportError::io(&path, e))?;
            debug!(
                "Wrote {} ({} of {} tracks)",
                path.display(),
                records.len(),
                playlist.track_ids.len()
            );
            written.push(path);
        }

        Ok(written)
    }

    async fn merge_itunes(&self, snapshot: &RegistrySnapshot) -> Result<Vec<PathBuf>, ExportError> {
        let dir = self
            .targets
            .itunes_dir
            .as_ref()
            .ok_or(ExportError::MissingLibraryPath)?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ExportError::io(dir, e))?;

        let path = dir.join(LIBRARY_FILE);
        let mut library = ItunesLibrary::load_or_create(&path, &self.targets.music_folder)
            .map_err(|e| ExportError::io(&path, e))?;

        for playlist in &snapshot.playlists {
            let records = snapshot.records(playlist);
            let ids = library.merge_tracks(&records);
            library.upsert_playlist(&playlist.title, playlist.guid.as_deref(), ids);
        }

        library
            .save(&path)
            .await
            .map_err(|e| ExportError::io(&path, e))?;
        Ok(vec![path])
    }
}
