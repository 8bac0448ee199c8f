//! CLI command handlers

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::generate;
use colored::Colorize;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use super::{AuthManager, Cli};
use crate::config::AppConfig;
use crate::export::{ExportFormat, parse_formats};
use crate::library::sanitize_filename;
use crate::library::clean::{CleanReport, prune_library, remove_stale_exports};
use crate::media::{MediaClient, Playlist};
use crate::sync::{SyncEngine, SyncReport};

/// Handle the `auth` command
pub async fn auth(url: Option<String>, token: Option<String>, force: bool) -> Result<()> {
    println!("{}", "Configuring Plex credentials...".cyan());

    let creds = AuthManager::authenticate(url, token, force).await?;

    let mut config = AppConfig::load()?;
    config.server_url = Some(creds.url.clone());
    config.save()?;

    println!();
    println!("{}", "Authentication successful!".green().bold());
    println!("  Server: {}", creds.url);
    println!();
    println!("Token stored securely in system keyring.");

    Ok(())
}

async fn server_playlists() -> Result<(Arc<dyn MediaClient>, Vec<Playlist>)> {
    let creds = AuthManager::require()?;
    let client: Arc<dyn MediaClient> = Arc::new(creds.client()?);
    let playlists = client
        .list_audio_playlists()
        .await
        .context("Failed to list playlists")?;
    Ok((client, playlists))
}

/// Handle the `list` command
pub async fn list() -> Result<()> {
    let config = AppConfig::load()?;
    let (_, playlists) = server_playlists().await?;

    if playlists.is_empty() {
        println!("{}", "No audio playlists on the server.".yellow());
        return Ok(());
    }

    for (idx, playlist) in playlists.iter().enumerate() {
        let title = &playlist.title;
        let line = if config.playlists.is_saved(&playlist.id) {
            format!("{} (saved)", title).green()
        } else if config.playlists.is_ignored(&playlist.id) {
            format!("{} (ignored)", title).red()
        } else {
            title.normal()
        };
        println!("{:>3}  {}", idx, line);
    }

    println!();
    println!(
        "Use {} to select playlists for download.",
        "plexmix enable <INDEX>...".cyan()
    );
    Ok(())
}

/// Playlists picked by index from `list` order
fn pick<'a>(playlists: &'a [Playlist], indices: &[usize], all: bool) -> Result<Vec<&'a Playlist>> {
    if all {
        return Ok(playlists.iter().collect());
    }

    indices
        .iter()
        .map(|&idx| {
            playlists.get(idx).ok_or_else(|| {
                anyhow::anyhow!(
                    "No playlist at index {} (the server has {})",
                    idx,
                    playlists.len()
                )
            })
        })
        .collect()
}

/// Handle the `enable` command
pub async fn enable(indices: Vec<usize>, all: bool) -> Result<()> {
    let mut config = AppConfig::load()?;
    let (_, playlists) = server_playlists().await?;

    for playlist in pick(&playlists, &indices, all)? {
        config.playlists.save(playlist);
        println!("  {} {}", "+".green(), playlist.title);
    }

    config.save()
}

/// Handle the `ignore` command
pub async fn ignore(indices: Vec<usize>, all: bool) -> Result<()> {
    let mut config = AppConfig::load()?;
    let (_, playlists) = server_playlists().await?;

    for playlist in pick(&playlists, &indices, all)? {
        config.playlists.ignore(playlist);
        println!("  {} {}", "-".red(), playlist.title);
    }

    config.save()
}

/// Split server playlists into saved ones and the rest; also report the
/// last known titles of saved playlists the server no longer has
fn partition_saved(
    config: &AppConfig,
    playlists: Vec<Playlist>,
) -> (Vec<Playlist>, Vec<Playlist>, Vec<String>) {
    let (saved, unsaved): (Vec<_>, Vec<_>) = playlists
        .into_iter()
        .partition(|p| config.playlists.is_saved(&p.id));

    let missing = config
        .playlists
        .saved
        .iter()
        .filter(|id| !saved.iter().any(|p| &p.id == *id))
        .map(|id| config.playlists.title_of(id).to_string())
        .collect();

    (saved, unsaved, missing)
}

/// Export titles to delete, minus any that a saved playlist still exports to
fn stale_titles(saved: &[Playlist], candidates: impl IntoIterator<Item = String>) -> Vec<String> {
    let live: HashSet<String> = saved.iter().map(|p| sanitize_filename(&p.title)).collect();
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|title| {
            let name = sanitize_filename(title);
            !live.contains(&name) && seen.insert(name)
        })
        .collect()
}

/// Load the config, list the server and pick the saved playlists
///
/// Titles are refreshed from the server; the previous titles of renamed
/// playlists are returned so their old exports can be cleaned.
async fn saved_playlists() -> Result<Option<Selected>> {
    let mut config = AppConfig::load()?;
    let (client, playlists) = server_playlists().await?;

    let renamed = config.playlists.refresh_titles(&playlists);
    if !renamed.is_empty() {
        config.save()?;
    }

    let (saved, unsaved, missing) = partition_saved(&config, playlists);
    for title in &missing {
        println!("{} {}", "Not on server:".yellow(), title);
    }
    if saved.is_empty() {
        println!(
            "{}",
            "No playlists selected. Run 'plexmix list' and 'plexmix enable' first.".yellow()
        );
        return Ok(None);
    }

    let stale = stale_titles(
        &saved,
        unsaved.into_iter().map(|p| p.title).chain(missing).chain(renamed),
    );
    Ok(Some(Selected {
        config,
        client,
        saved,
        stale,
    }))
}

struct Selected {
    config: AppConfig,
    client: Arc<dyn MediaClient>,
    saved: Vec<Playlist>,
    stale: Vec<String>,
}

fn resolve_formats(config: &AppConfig, requested: &[String]) -> Vec<ExportFormat> {
    let (formats, errors) = if requested.is_empty() {
        config.export_formats()
    } else {
        parse_formats(requested)
    };
    for e in errors {
        warn!("{}", e);
        println!("{} {}", "Skipping:".yellow(), e);
    }
    formats
}

/// Handle the `itunes` command
///
/// Regenerates exports from the tracks already on disk without transferring
/// anything. Only the iTunes library is written unless formats are given.
pub async fn itunes(formats: Vec<String>) -> Result<()> {
    let Some(Selected {
        config,
        client,
        saved,
        ..
    }) = saved_playlists().await?
    else {
        return Ok(());
    };

    let formats = if formats.is_empty() {
        vec![ExportFormat::Itunes]
    } else {
        resolve_formats(&config, &formats)
    };
    println!(
        "Exporting {} playlist(s) to {}",
        saved.len(),
        config.itunes_dir().display().to_string().green()
    );

    let engine = SyncEngine::new(client, &config);
    let report = engine.export_existing(&saved, &formats).await;
    print_report(&report, "Export");

    if report.is_clean() {
        Ok(())
    } else {
        anyhow::bail!("Export finished with errors")
    }
}

/// Handle the `download` command
pub async fn download(force: bool, clean: bool, formats: Vec<String>) -> Result<()> {
    let Some(Selected {
        config,
        client,
        saved,
        stale,
    }) = saved_playlists().await?
    else {
        return Ok(());
    };

    let formats = resolve_formats(&config, &formats);
    println!(
        "Downloading {} playlist(s) to {}",
        saved.len(),
        config.library_path.display().to_string().green()
    );

    let engine = SyncEngine::new(client, &config);
    let report = engine.sync(&saved, &formats, force).await;
    print_report(&report, "Download");

    if clean {
        if report.failed_playlists.is_empty() {
            let keep: HashSet<PathBuf> = engine
                .exporter()
                .snapshot()
                .tracks
                .into_values()
                .map(|record| record.path)
                .collect();
            let cleaned = clean_library(&config, stale, keep).await?;
            println!(
                "  Cleaned: {} exports, {} files, {} directories",
                cleaned.exports_removed, cleaned.files_removed, cleaned.dirs_removed
            );
        } else {
            println!(
                "{}",
                "Skipping clean: not every playlist could be listed.".yellow()
            );
        }
    }

    if report.is_clean() {
        Ok(())
    } else {
        anyhow::bail!("Download finished with errors")
    }
}

async fn clean_library(
    config: &AppConfig,
    stale_titles: Vec<String>,
    keep: HashSet<PathBuf>,
) -> Result<CleanReport> {
    let library = config.library_path.clone();
    let playlists_dir = config.playlists_path.clone();
    let protected = vec![playlists_dir.clone(), config.itunes_dir().to_path_buf()];

    tokio::task::spawn_blocking(move || -> Result<CleanReport> {
        let exports_removed = remove_stale_exports(&playlists_dir, &stale_titles)?;
        let mut report = prune_library(&library, &keep, &protected)?;
        report.exports_removed = exports_removed;
        Ok(report)
    })
    .await
    .context("Clean task failed")?
}

fn print_report(report: &SyncReport, action: &str) {
    println!();
    if report.is_clean() {
        println!("{}", format!("{} complete!", action).green().bold());
    } else {
        println!("{}", format!("{} finished with errors", action).yellow().bold());
    }
    println!("  Playlists synced: {}", report.playlists_synced);
    println!("  Tracks available: {}", report.tracks_fetched);

    for (title, e) in &report.failed_playlists {
        println!("  {} {}: {:#}", "Playlist failed:".red(), title, e);
    }
    for (track, e) in &report.failed_tracks {
        println!("  {} {}: {}", "Track failed:".red(), track.title, e);
    }
    for result in &report.export.formats {
        match &result.result {
            Ok(paths) => println!("  Exported {}: {} file(s)", result.format, paths.len()),
            Err(e) => println!("  {} {}: {}", "Export failed:".red(), result.format, e),
        }
    }
}

/// Settings accepted by the `config` command
#[derive(Debug, Default)]
pub struct ConfigChanges {
    pub library: Option<PathBuf>,
    pub playlists: Option<PathBuf>,
    pub itunes: Option<PathBuf>,
    pub threads: Option<usize>,
    pub subfolders: Option<bool>,
    pub formats: Vec<String>,
}

impl ConfigChanges {
    fn is_empty(&self) -> bool {
        self.library.is_none()
            && self.playlists.is_none()
            && self.itunes.is_none()
            && self.threads.is_none()
            && self.subfolders.is_none()
            && self.formats.is_empty()
    }

    fn apply(self, config: &mut AppConfig) -> Result<()> {
        if !self.formats.is_empty() {
            let (_, errors) = parse_formats(&self.formats);
            if let Some(e) = errors.into_iter().next() {
                return Err(e.into());
            }
            config.formats = self.formats;
        }
        if let Some(library) = self.library {
            config.library_path = library;
        }
        if let Some(playlists) = self.playlists {
            config.playlists_path = playlists;
        }
        if let Some(itunes) = self.itunes {
            config.itunes_path = Some(itunes);
        }
        if let Some(threads) = self.threads {
            anyhow::ensure!(threads > 0, "threads must be at least 1");
            config.threads = threads;
        }
        if let Some(subfolders) = self.subfolders {
            config.subfolders = subfolders;
        }
        Ok(())
    }
}

/// Handle the `config` command
pub fn config(changes: ConfigChanges) -> Result<()> {
    let mut config = AppConfig::load()?;

    if !changes.is_empty() {
        changes.apply(&mut config)?;
        config.save()?;
        println!("{}", "Configuration updated.".green());
    }

    println!("  File:       {}", AppConfig::config_path()?.display());
    println!(
        "  Server:     {}",
        config.server_url.as_deref().unwrap_or("(not configured)")
    );
    println!("  Library:    {}", config.library_path.display());
    println!("  Playlists:  {}", config.playlists_path.display());
    println!("  iTunes:     {}", config.itunes_dir().display());
    println!("  Threads:    {}", config.threads);
    println!("  Subfolders: {}", config.subfolders);
    println!("  Formats:    {}", config.formats.join(", "));
    println!("  Saved:      {}", config.playlists.saved.len());
    println!("  Ignored:    {}", config.playlists.ignored.len());

    Ok(())
}

/// Handle the `completion` command
pub fn completion(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "plexmix", &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::playlist;

    fn server() -> Vec<Playlist> {
        vec![
            playlist("1", "Chill"),
            playlist("2", "Workout"),
            playlist("3", "Jazz"),
        ]
    }

    #[test]
    fn test_pick_by_index() {
        let playlists = server();
        let picked = pick(&playlists, &[2, 0], false).unwrap();
        let titles: Vec<_> = picked.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["Jazz", "Chill"]);

        assert_eq!(pick(&playlists, &[], true).unwrap().len(), 3);
        assert!(pick(&playlists, &[3], false).is_err());
    }

    #[test]
    fn test_partition_saved_reports_missing() {
        let mut config = AppConfig::with_library(PathBuf::from("/music"));
        config.playlists.save(&playlist("3", "Jazz"));
        config.playlists.save(&playlist("8", "Deleted Mix"));
        config.playlists.ignore(&playlist("2", "Workout"));

        let (saved, unsaved, missing) = partition_saved(&config, server());
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].title, "Jazz");
        assert_eq!(unsaved.len(), 2);
        assert_eq!(missing, ["Deleted Mix"]);
    }

    #[test]
    fn test_selection_follows_id_through_rename() {
        let mut config = AppConfig::with_library(PathBuf::from("/music"));
        config.playlists.save(&playlist("3", "Jazz"));
        config.playlists.save(&playlist("5", "Bebop"));

        let server = vec![
            playlist("1", "Chill"),
            playlist("3", "Late Night Jazz"),
            playlist("5", "Jazz"),
        ];
        let renamed = config.playlists.refresh_titles(&server);
        assert_eq!(renamed, ["Jazz", "Bebop"]);

        let (saved, unsaved, missing) = partition_saved(&config, server);
        let ids: Vec<_> = saved.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["3", "5"]);
        assert!(missing.is_empty());

        // Jazz.m3u8 now belongs to playlist 5
        let stale = stale_titles(&saved, unsaved.into_iter().map(|p| p.title).chain(renamed));
        assert_eq!(stale, ["Chill", "Bebop"]);
    }

    #[test]
    fn test_stale_titles_skip_live_exports() {
        let saved = vec![playlist("3", "Road Trip")];
        let stale = stale_titles(
            &saved,
            [" Road Trip ".to_string(), "Old".to_string(), "Old".to_string()],
        );
        assert_eq!(stale, ["Old"]);
    }

    #[test]
    fn test_config_changes_validate_formats() {
        let mut config = AppConfig::with_library(PathBuf::from("/music"));
        let changes = ConfigChanges {
            formats: vec!["m3u8".to_string(), "wpl".to_string()],
            threads: Some(8),
            ..Default::default()
        };
        assert!(changes.apply(&mut config).is_err());
        assert_eq!(config.formats, ["m3u8"]);

        let changes = ConfigChanges {
            formats: vec!["json".to_string(), "itunes".to_string()],
            threads: Some(8),
            subfolders: Some(false),
            ..Default::default()
        };
        changes.apply(&mut config).unwrap();
        assert_eq!(config.formats, ["json", "itunes"]);
        assert_eq!(config.threads, 8);
        assert!(!config.subfolders);
    }

    #[tokio::test]
    async fn test_clean_keeps_referenced_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::with_library(dir.path().join("music"));
        let album = config.library_path.join("Artist").join("Album");
        std::fs::create_dir_all(&album).unwrap();
        std::fs::create_dir_all(&config.playlists_path).unwrap();

        let kept = album.join("1 One.flac");
        std::fs::write(&kept, b"keep").unwrap();
        std::fs::write(album.join("2 Two.flac"), b"drop").unwrap();
        std::fs::write(config.playlists_path.join("Old.m3u8"), b"#EXTM3U\n").unwrap();
        std::fs::write(config.playlists_path.join("Jazz.m3u8"), b"#EXTM3U\n").unwrap();

        let keep = HashSet::from([kept.clone()]);
        let report = clean_library(&config, vec!["Old".to_string()], keep)
            .await
            .unwrap();

        assert_eq!(report.exports_removed, 1);
        assert_eq!(report.files_removed, 1);
        assert!(kept.exists());
        assert!(config.playlists_path.join("Jazz.m3u8").exists());
    }
}
