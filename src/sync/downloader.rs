//! Bounded parallel download pool

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::library::{FetchError, FetchOptions, fetch_track};
use crate::media::{MediaClient, Track};

/// Default number of concurrent transfers
pub const DEFAULT_THREADS: usize = 4;

/// Final state of one track's fetch
#[derive(Debug)]
pub struct FetchOutcome {
    pub track: Track,
    pub result: Result<PathBuf, FetchError>,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A fetch that has been scheduled on the pool
pub struct PendingFetch {
    track: Track,
    handle: JoinHandle<Result<PathBuf, FetchError>>,
}

impl PendingFetch {
    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Wait for the fetch to finish
    pub async fn wait(self) -> FetchOutcome {
        let result = match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Fetch task for {} panicked or was cancelled: {}", self.track.title, e);
                Err(FetchError::Aborted {
                    track_id: self.track.id.clone(),
                    reason: e.to_string(),
                })
            }
        };

        FetchOutcome {
            track: self.track,
            result,
        }
    }
}

/// Wait for every pending fetch, returning outcomes in submission order
pub async fn wait_all(pending: Vec<PendingFetch>) -> Vec<FetchOutcome> {
    let mut outcomes = Vec::with_capacity(pending.len());
    for fetch in pending {
        outcomes.push(fetch.wait().await);
    }
    outcomes
}

/// Fixed-width worker pool shared by every playlist of a run
///
/// Each submitted track becomes its own task which holds one of `threads`
/// permits while it runs, so fetches from different playlists interleave
/// but never exceed the configured width.
#[derive(Clone)]
pub struct DownloadPool {
    client: Arc<dyn MediaClient>,
    permits: Arc<Semaphore>,
    library_dir: PathBuf,
    subfolders: bool,
}

impl DownloadPool {
    /// Create a new pool; a width of 0 falls back to [`DEFAULT_THREADS`]
    pub fn new(
        client: Arc<dyn MediaClient>,
        library_dir: &Path,
        subfolders: bool,
        threads: usize,
    ) -> Self {
        let threads = if threads == 0 { DEFAULT_THREADS } else { threads };
        Self {
            client,
            permits: Arc::new(Semaphore::new(threads)),
            library_dir: library_dir.to_path_buf(),
            subfolders,
        }
    }

    /// Schedule a fetch for every track without waiting for any of them
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, tracks: &[Track], overwrite: bool) -> Vec<PendingFetch> {
        let options = Arc::new(FetchOptions {
            library_dir: self.library_dir.clone(),
            subfolders: self.subfolders,
            overwrite,
        });

        tracks
            .iter()
            .map(|track| {
                let client = self.client.clone();
                let permits = self.permits.clone();
                let options = options.clone();
                let task_track = track.clone();

                let handle = tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.map_err(|e| {
                        FetchError::Aborted {
                            track_id: task_track.id.clone(),
                            reason: e.to_string(),
                        }
                    })?;

                    debug!("Fetching: {}", task_track.title);
                    let result = fetch_track(client.as_ref(), &task_track, &options).await;
                    if let Err(e) = &result {
                        warn!("Fetch failed: {}", e);
                    }
                    result
                });

                PendingFetch {
                    track: track.clone(),
                    handle,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{FakeClient, track};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeClient::default();
        client.failing.insert("2".to_string());
        let pool = DownloadPool::new(Arc::new(client), dir.path(), true, 2);

        let tracks = vec![track("1", "One", 8), track("2", "Two", 8), track("3", "Three", 8)];
        let outcomes = wait_all(pool.submit(&tracks, false)).await;

        let ids: Vec<_> = outcomes.iter().map(|o| o.track.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1].result, Err(FetchError::Transfer { .. })));
        assert!(outcomes[2].is_ok());
    }

    /// Counts how many transfers run at the same time
    struct SlowClient {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MediaClient for SlowClient {
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
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(dest_dir.join(&track.remote_file_name), vec![0u8; 4]).await?;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_width_is_shared_across_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowClient {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = DownloadPool::new(client.clone(), dir.path(), false, 2);

        let first: Vec<_> = (0..4).map(|i| track(&format!("a{i}"), "A", 4)).collect();
        let second: Vec<_> = (0..4).map(|i| track(&format!("b{i}"), "B", 4)).collect();
        let pending_a = pool.submit(&first, false);
        let pending_b = pool.submit(&second, false);

        let (a, b) = tokio::join!(wait_all(pending_a), wait_all(pending_b));
        assert!(a.iter().chain(b.iter()).all(FetchOutcome::is_ok));
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }
}
