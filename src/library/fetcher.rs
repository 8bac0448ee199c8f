//! Ensures a single track is present and complete on disk

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use super::path::{normalize_component, track_path};
use crate::media::{MediaClient, Track};

/// Name prefix of the per-track directories transfers are written into
pub const STAGING_PREFIX: &str = ".plexmix-partial-";

/// Why a track could not be made available locally
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transfer of track {track_id} failed: {source}")]
    Transfer {
        track_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("track {track_id} transferred but no matching file appeared in {}", .dir.display())]
    Missing { track_id: String, dir: PathBuf },

    #[error("filesystem error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch task for track {track_id} did not complete: {reason}")]
    Aborted { track_id: String, reason: String },
}

impl FetchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where to put tracks and how to treat existing files
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub library_dir: PathBuf,
    pub subfolders: bool,
    pub overwrite: bool,
}

/// Make sure `track` exists locally and return its resolved path
///
/// An existing file is kept when its size matches the server's; otherwise
/// (or with `overwrite`) the track is transferred again.
pub async fn fetch_track(
    client: &dyn MediaClient,
    track: &Track,
    options: &FetchOptions,
) -> Result<PathBuf, FetchError> {
    let (album_dir, file_path) = track_path(
        track.artist.as_deref(),
        track.album.as_deref(),
        &track.remote_file_name,
        &options.library_dir,
        options.subfolders,
    );

    // Sibling fetches may create the same album directory concurrently;
    // create_dir_all treats an existing directory as success.
    fs::create_dir_all(&album_dir)
        .await
        .map_err(|e| FetchError::io(&album_dir, e))?;

    if !options.overwrite {
        if let Some(local_size) = file_size(&file_path).await? {
            match track.size {
                Some(remote_size) if remote_size == local_size => {
                    debug!("Skipping complete file: {}", file_path.display());
                    return Ok(file_path);
                }
                Some(remote_size) => {
                    debug!(
                        "Size mismatch for {} (local {} / remote {}), downloading again",
                        file_path.display(),
                        local_size,
                        remote_size
                    );
                }
                None => {
                    debug!("No remote size for {}, keeping local file", track.title);
                    return Ok(file_path);
                }
            }
        }
    }

    let staging = staging_dir(&album_dir, &track.id);
    fresh_dir(&staging).await?;

    debug!("Downloading: {} -> {}", track.title, album_dir.display());
    let transferred = client.download(track, &staging).await;
    let placed = match transferred {
        Ok(()) => place_downloaded(&staging, &file_path).await,
        Err(source) => Err(FetchError::Transfer {
            track_id: track.id.clone(),
            source,
        }),
    };

    if let Err(e) = fs::remove_dir_all(&staging).await {
        debug!("Could not remove {}: {}", staging.display(), e);
    }

    if placed? {
        Ok(file_path)
    } else {
        Err(FetchError::Missing {
            track_id: track.id.clone(),
            dir: album_dir,
        })
    }
}

async fn file_size(path: &Path) -> Result<Option<u64>, FetchError> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FetchError::io(path, e)),
    }
}

/// Private per-track directory the transfer writes into
///
/// Each fetch only ever sees its own files there, whatever sibling fetches
/// write into the album directory at the same time.
fn staging_dir(album_dir: &Path, track_id: &str) -> PathBuf {
    album_dir.join(format!("{}{}", STAGING_PREFIX, normalize_component(track_id)))
}

/// Create `dir` empty, dropping leftovers of an interrupted run
async fn fresh_dir(dir: &Path) -> Result<(), FetchError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed stale staging directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(FetchError::io(dir, e)),
    }
    fs::create_dir_all(dir)
        .await
        .map_err(|e| FetchError::io(dir, e))
}

/// File name -> (size, mtime) for every regular file in `dir`
async fn snapshot_dir(dir: &Path) -> Result<HashMap<PathBuf, (u64, Option<SystemTime>)>, FetchError> {
    let mut entries = HashMap::new();
    let mut read_dir = fs::read_dir(dir).await.map_err(|e| FetchError::io(dir, e))?;

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| FetchError::io(dir, e))?
    {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            // Vanished between listing and stat, or not a file
            _ => continue,
        };
        entries.insert(entry.path(), (meta.len(), meta.modified().ok()));
    }

    Ok(entries)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// Move the file a transfer wrote into `staging` to `predicted`
///
/// The server may save under any name, so the staging directory is scanned.
/// Files with the predicted extension are preferred, then the newest one.
/// Returns `false` when the transfer left nothing behind.
async fn place_downloaded(staging: &Path, predicted: &Path) -> Result<bool, FetchError> {
    let written = snapshot_dir(staging).await?;
    let wanted_ext = extension_of(predicted);

    let mut candidates: Vec<(&PathBuf, Option<SystemTime>)> = written
        .iter()
        .map(|(path, (_, modified))| (path, *modified))
        .collect();
    // Matching extension first, then newest, name as a tie breaker
    candidates.sort_by(|a, b| {
        (extension_of(b.0) == wanted_ext)
            .cmp(&(extension_of(a.0) == wanted_ext))
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.0.cmp(b.0))
    });

    let Some((downloaded, _)) = candidates.first() else {
        return Ok(false);
    };

    if downloaded.file_name() != predicted.file_name() {
        debug!(
            "Server saved {} for {}",
            downloaded.display(),
            predicted.display()
        );
    }
    fs::rename(downloaded, predicted)
        .await
        .map_err(|e| FetchError::io(predicted, e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{FakeClient, track};

    fn options(dir: &Path, overwrite: bool) -> FetchOptions {
        FetchOptions {
            library_dir: dir.to_path_buf(),
            subfolders: true,
            overwrite,
        }
    }

    #[tokio::test]
    async fn test_complete_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient::default();
        let t = track("1", "Hidden Place", 64);

        let first = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        assert_eq!(client.download_count(), 1);

        let second = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        assert_eq!(client.download_count(), 1);
        assert_eq!(first, second);
        assert!(first.ends_with("Artist/Album/1 Hidden Place.flac"));
    }

    #[tokio::test]
    async fn test_truncated_file_is_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient::default();
        let t = track("1", "Hidden Place", 64);

        let path = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        std::fs::write(&path, [0u8; 10]).unwrap();

        fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        assert_eq!(client.download_count(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_overwrite_always_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient::default();
        let t = track("1", "Hidden Place", 64);

        fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        fetch_track(&client, &t, &options(dir.path(), true)).await.unwrap();
        assert_eq!(client.download_count(), 2);
    }

    #[tokio::test]
    async fn test_server_chosen_name_is_moved_to_predicted_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeClient::default();
        client
            .renamed
            .insert("7".to_string(), "Björk - Hidden Place (remaster).flac".to_string());
        let t = track("7", "Hidden Place", 32);

        let path = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        assert!(path.ends_with("Artist/Album/7 Hidden Place.flac"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);

        let album = dir.path().join("Artist").join("Album");
        let names: Vec<_> = std::fs::read_dir(&album)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_punctuated_remote_name_is_skipped_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let client = FakeClient::default();
        let mut t = track("4021", "Hidden Place", 48);
        t.remote_file_name = "01. Hidden Place (Live), Björk's.flac".to_string();

        let first = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();
        let second = fetch_track(&client, &t, &options(dir.path(), false)).await.unwrap();

        assert_eq!(client.download_count(), 1);
        assert_eq!(first, second);
        assert!(first.ends_with("Artist/Album/01 Hidden Place Live Bjorks.flac"));
    }

    /// Saves under a server-chosen name; one track lingers before finishing
    struct SlowRenamingClient;

    #[async_trait::async_trait]
    impl MediaClient for SlowRenamingClient {
        async fn list_audio_playlists(&self) -> anyhow::Result<Vec<crate::media::Playlist>> {
            Ok(Vec::new())
        }

        async fn playlist_items(
            &self,
            _playlist: &crate::media::Playlist,
        ) -> anyhow::Result<Vec<Track>> {
            Ok(Vec::new())
        }

        async fn download(&self, track: &Track, dest_dir: &Path) -> anyhow::Result<()> {
            let name = format!("Server Name {}.flac", track.id);
            let data = vec![0u8; track.size.unwrap_or(0) as usize];
            tokio::fs::write(dest_dir.join(name), data).await?;
            if track.id == "A" {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_flat_fetches_keep_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let flat = FetchOptions {
            library_dir: dir.path().to_path_buf(),
            subfolders: false,
            overwrite: false,
        };
        let a = track("A", "Alpha", 11);
        let b = track("B", "Beta", 22);

        let client = SlowRenamingClient;
        let (path_a, path_b) = tokio::join!(
            fetch_track(&client, &a, &flat),
            fetch_track(&client, &b, &flat)
        );
        let (path_a, path_b) = (path_a.unwrap(), path_b.unwrap());

        assert_eq!(path_a, dir.path().join("A Alpha.flac"));
        assert_eq!(path_b, dir.path().join("B Beta.flac"));
        assert_eq!(std::fs::metadata(&path_a).unwrap().len(), 11);
        assert_eq!(std::fs::metadata(&path_b).unwrap().len(), 22);
    }

    #[tokio::test]
    async fn test_transfer_failure_is_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeClient::default();
        client.failing.insert("9".to_string());
        let t = track("9", "Broken", 32);

        let err = fetch_track(&client, &t, &options(dir.path(), false))
            .await
            .unwrap_err();
        match err {
            FetchError::Transfer { track_id, .. } => assert_eq!(track_id, "9"),
            other => panic!("unexpected error: {other}"),
        }

        let album = dir.path().join("Artist").join("Album");
        assert_eq!(std::fs::read_dir(&album).unwrap().count(), 0);
    }
}
