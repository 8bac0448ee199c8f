//! Sync engine orchestration

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::export::{ExportFormat, ExportReport, Exporter};
use crate::library::{FetchError, track_path};
use crate::media::{MediaClient, Playlist, Track};
use crate::sync::downloader::{DownloadPool, FetchOutcome, PendingFetch};

/// Result of a sync run
#[derive(Debug, Default)]
pub struct SyncReport {
    pub playlists_synced: usize,
    /// Distinct tracks present on disk after the run
    pub tracks_fetched: usize,
    pub failed_tracks: Vec<(Track, FetchError)>,
    /// Playlists whose item listing could not be retrieved
    pub failed_playlists: Vec<(String, anyhow::Error)>,
    pub export: ExportReport,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed_tracks.is_empty()
            && self.failed_playlists.is_empty()
            && self.export.failures().next().is_none()
    }
}

/// A playlist entry either owns a fetch or reuses one scheduled earlier
enum Slot {
    Fetch(PendingFetch),
    Shared(Track),
}

struct Scheduled {
    playlist: Playlist,
    slots: Vec<Slot>,
}

/// Sync engine that coordinates fetching playlists and exporting them
pub struct SyncEngine {
    client: Arc<dyn MediaClient>,
    pool: DownloadPool,
    exporter: Exporter,
    library_dir: PathBuf,
    subfolders: bool,
}

impl SyncEngine {
    /// Create a new sync engine
    pub fn new(client: Arc<dyn MediaClient>, config: &AppConfig) -> Self {
        let pool = DownloadPool::new(
            client.clone(),
            &config.library_path,
            config.subfolders,
            config.threads,
        );
        let exporter = Exporter::new(config.export_targets());

        Self {
            client,
            pool,
            exporter,
            library_dir: config.library_path.clone(),
            subfolders: config.subfolders,
        }
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Fetch every playlist's tracks, register them and export
    ///
    /// All playlists are submitted to the pool before any is waited on, so
    /// transfers from different playlists share the pool's width.
    pub async fn sync(
        &self,
        playlists: &[Playlist],
        formats: &[ExportFormat],
        overwrite: bool,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let scheduled = self.schedule(playlists, overwrite, &mut report).await;

        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());

        let mut results: HashMap<String, Result<PathBuf, String>> = HashMap::new();

        for Scheduled { playlist, slots } in scheduled {
            let progress = multi.add(ProgressBar::new(slots.len() as u64));
            progress.set_style(style.clone());
            progress.set_message(playlist.title.clone());

            let mut outcomes = Vec::with_capacity(slots.len());
            let mut owned = Vec::with_capacity(slots.len());

            for slot in slots {
                let outcome = match slot {
                    Slot::Fetch(pending) => {
                        let outcome = pending.wait().await;
                        results.insert(
                            outcome.track.id.clone(),
                            outcome
                                .result
                                .as_ref()
                                .map(PathBuf::clone)
                                .map_err(ToString::to_string),
                        );
                        owned.push(true);
                        outcome
                    }
                    Slot::Shared(track) => {
                        let result = match results.get(&track.id) {
                            Some(Ok(path)) => Ok(path.clone()),
                            Some(Err(reason)) => Err(FetchError::Aborted {
                                track_id: track.id.clone(),
                                reason: reason.clone(),
                            }),
                            None => Err(FetchError::Aborted {
                                track_id: track.id.clone(),
                                reason: "shared fetch was never scheduled".to_string(),
                            }),
                        };
                        owned.push(false);
                        FetchOutcome { track, result }
                    }
                };
                progress.inc(1);
                outcomes.push(outcome);
            }

            let ok = outcomes.iter().filter(|o| o.is_ok()).count();
            if self.exporter.register(&playlist, &outcomes) {
                report.playlists_synced += 1;
            }
            progress.finish_with_message(format!("{} ({}/{})", playlist.title, ok, outcomes.len()));
            info!("Synced playlist: {} ({}/{} tracks)", playlist.title, ok, outcomes.len());

            for (outcome, owned) in outcomes.into_iter().zip(owned) {
                match outcome.result {
                    Ok(_) if owned => report.tracks_fetched += 1,
                    Err(e) if owned => report.failed_tracks.push((outcome.track, e)),
                    _ => {}
                }
            }
        }

        report.export = self.exporter.proceed(formats).await;
        report
    }

    /// Register playlists from the files already on disk and export them
    ///
    /// Nothing is transferred; tracks that are not present locally are
    /// reported as missing and left out of the exports.
    pub async fn export_existing(
        &self,
        playlists: &[Playlist],
        formats: &[ExportFormat],
    ) -> SyncReport {
        let mut report = SyncReport::default();

        for playlist in playlists {
            let Some(tracks) = self.list_items(playlist, &mut report).await else {
                continue;
            };

            let mut outcomes = Vec::with_capacity(tracks.len());
            for track in tracks {
                let (album_dir, file_path) = track_path(
                    track.artist.as_deref(),
                    track.album.as_deref(),
                    &track.remote_file_name,
                    &self.library_dir,
                    self.subfolders,
                );
                let present = tokio::fs::metadata(&file_path)
                    .await
                    .is_ok_and(|meta| meta.is_file());
                let result = if present {
                    Ok(file_path)
                } else {
                    debug!("Not on disk: {}", file_path.display());
                    Err(FetchError::Missing {
                        track_id: track.id.clone(),
                        dir: album_dir,
                    })
                };
                outcomes.push(FetchOutcome { track, result });
            }

            if self.exporter.register(playlist, &outcomes) {
                report.playlists_synced += 1;
            }
            for outcome in outcomes {
                match outcome.result {
                    Ok(_) => report.tracks_fetched += 1,
                    Err(e) => report.failed_tracks.push((outcome.track, e)),
                }
            }
        }

        report.export = self.exporter.proceed(formats).await;
        report
    }

    async fn list_items(&self, playlist: &Playlist, report: &mut SyncReport) -> Option<Vec<Track>> {
        match self.client.playlist_items(playlist).await {
            Ok(tracks) => Some(tracks),
            Err(e) => {
                error!("Failed to list playlist {}: {:#}", playlist.title, e);
                report.failed_playlists.push((playlist.title.clone(), e));
                None
            }
        }
    }

    /// List every playlist's items and submit their fetches
    async fn schedule(
        &self,
        playlists: &[Playlist],
        overwrite: bool,
        report: &mut SyncReport,
    ) -> Vec<Scheduled> {
        let mut submitted: HashSet<String> = HashSet::new();
        let mut scheduled = Vec::with_capacity(playlists.len());

        for playlist in playlists {
            let Some(tracks) = self.list_items(playlist, report).await else {
                continue;
            };

            let fresh: Vec<Track> = tracks
                .iter()
                .filter(|t| submitted.insert(t.id.clone()))
                .cloned()
                .collect();
            debug!(
                "Playlist {}: {} tracks, {} new to this run",
                playlist.title,
                tracks.len(),
                fresh.len()
            );

            let mut pending: HashMap<String, PendingFetch> = self
                .pool
                .submit(&fresh, overwrite)
                .into_iter()
                .map(|p| (p.track().id.clone(), p))
                .collect();

            let slots = tracks
                .into_iter()
                .map(|track| match pending.remove(&track.id) {
                    Some(fetch) => Slot::Fetch(fetch),
                    None => Slot::Shared(track),
                })
                .collect();

            scheduled.push(Scheduled {
                playlist: playlist.clone(),
                slots,
            });
        }

        if !report.failed_playlists.is_empty() {
            warn!("{} playlists could not be listed", report.failed_playlists.len());
        }
        scheduled
    }
}
