use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::TranscodeConfig;

/// Whether `file_name` is a working file this crate creates in the temp dir
pub fn is_temp_artifact(file_name: &str) -> bool {
    file_name.starts_with("temp_") || (file_name.starts_with("progress_") && file_name.ends_with(".txt"))
}

fn find_orphans(dir: &Path, min_age: Duration, now: SystemTime) -> Vec<PathBuf> {
    let mut orphans = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading temp directory entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !is_temp_artifact(name) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= min_age {
            orphans.push(entry.into_path());
        } else {
            debug!("Leaving recent temp file: {}", entry.path().display());
        }
    }

    orphans
}

/// Delete temp outputs and progress files left behind by a crashed run.
///
/// Only files older than `orphan_age_secs` are touched, so jobs of another
/// process sharing the directory keep theirs. Returns the number removed.
pub async fn sweep_orphaned_temp_files(cfg: &TranscodeConfig) -> Result<usize> {
    if !cfg.temp_dir.exists() {
        return Ok(0);
    }
    info!("Checking for orphaned temp files in {}...", cfg.temp_dir.display());

    let orphans = tokio::task::spawn_blocking({
        let dir = cfg.temp_dir.clone();
        let min_age = cfg.orphan_age();
        move || find_orphans(&dir, min_age, SystemTime::now())
    })
    .await
    .context("Failed to scan for orphaned temp files")?;

    let mut cleaned = 0;
    for path in orphans {
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to delete orphaned temp file: {}", path.display()))?;
        info!("Deleted orphaned temp file: {}", path.display());
        cleaned += 1;
    }

    if cleaned > 0 {
        info!("Cleaned up {} orphaned temp file(s)", cleaned);
    } else {
        debug!("No orphaned temp files found");
    }
    Ok(cleaned)
}
