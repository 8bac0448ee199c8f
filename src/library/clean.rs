//! Removal of files no saved playlist refers to any more

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::path::sanitize_filename;

/// Extensions written by the playlist exporters
const EXPORT_EXTENSIONS: [&str; 2] = ["m3u8", "json"];

/// What a clean pass removed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanReport {
    pub exports_removed: usize,
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Delete exported playlist files for playlists that are no longer saved
pub fn remove_stale_exports(playlists_dir: &Path, stale_titles: &[String]) -> Result<usize> {
    let mut removed = 0;

    for title in stale_titles {
        let name = sanitize_filename(title);
        for ext in EXPORT_EXTENSIONS {
            let path = playlists_dir.join(format!("{}.{}", name, ext));
            if path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                debug!("Removed stale export: {}", path.display());
                removed += 1;
            }
        }
    }

    Ok(removed)
}

/// Delete every file under `library_dir` that is not in `keep`
///
/// Directories listed in `protected` (export folders living inside the
/// library) are left untouched. Empty directories are removed afterwards,
/// deepest first; `library_dir` itself is kept.
pub fn prune_library(
    library_dir: &Path,
    keep: &HashSet<PathBuf>,
    protected: &[PathBuf],
) -> Result<CleanReport> {
    let mut report = CleanReport::default();

    let walker = WalkDir::new(library_dir)
        .into_iter()
        .filter_entry(|entry| !protected.iter().any(|p| entry.path() == p.as_path()));

    for entry in walker {
        let entry = entry.context("Failed to walk library directory")?;
        if entry.file_type().is_file() && !keep.contains(entry.path()) {
            fs::remove_file(entry.path())
                .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
            debug!("Removed unreferenced file: {}", entry.path().display());
            report.files_removed += 1;
        }
    }

    let walker = WalkDir::new(library_dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_entry(|entry| !protected.iter().any(|p| entry.path() == p.as_path()));

    for entry in walker {
        let entry = entry.context("Failed to walk library directory")?;
        if entry.file_type().is_dir() && is_empty_dir(entry.path())? {
            fs::remove_dir(entry.path())
                .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
            report.dirs_removed += 1;
        }
    }

    info!(
        "Cleaned library: {} files and {} directories removed",
        report.files_removed, report.dirs_removed
    );
    Ok(report)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_referenced_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let kept = root.join("A/Album/keep.flac");
        let dropped = root.join("B/Other/drop.flac");
        let export = root.join("playlists/Mix.m3u8");
        for path in [&kept, &dropped, &export] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"x").unwrap();
        }

        let keep: HashSet<PathBuf> = [kept.clone()].into_iter().collect();
        let report = prune_library(root, &keep, &[root.join("playlists")]).unwrap();

        assert!(kept.exists());
        assert!(!dropped.exists());
        assert!(export.exists());
        assert!(!root.join("B").exists());
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.dirs_removed, 2);
    }

    #[test]
    fn test_remove_stale_exports() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Old ⧸ Mix.m3u8"), "#EXTM3U\n").unwrap();
        fs::write(dir.path().join("Old ⧸ Mix.json"), "[]").unwrap();
        fs::write(dir.path().join("Saved.m3u8"), "#EXTM3U\n").unwrap();

        let removed = remove_stale_exports(dir.path(), &["Old / Mix".to_string()]).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("Saved.m3u8").exists());
    }
}
