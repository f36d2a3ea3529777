//! Filesystem discovery of saved HTML documents.
//!
//! Walks the watch directory recursively and keeps regular files whose path
//! (relative to the watch directory) matches one of the configured globs.
//! Entries that cannot be read (unreadable directories, broken links, files
//! removed mid-walk) are logged and skipped.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::models::FileRecord;

/// Enumerate candidate files under `watch.dir`. A missing root yields nothing.
pub fn discover_files(watch: &WatchConfig) -> Result<Vec<FileRecord>> {
    let root = watch.dir.as_path();
    if !root.exists() {
        return Ok(Vec::new());
    }

    let include_set = build_globset(&watch.patterns)?;
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(watch.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !include_set.is_match(relative) {
            continue;
        }

        match file_record(path) {
            Ok(record) => files.push(record),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping file"),
        }
    }

    // Deterministic before any time-based sort
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Stat `path` into a [`FileRecord`].
pub fn file_record(path: &Path) -> Result<FileRecord> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata.modified().map(epoch_secs).unwrap_or(0.0);
    let birthtime = metadata.created().ok().map(epoch_secs);

    Ok(FileRecord {
        path: path.to_path_buf(),
        mtime,
        size: metadata.len(),
        birthtime,
    })
}

/// Read a saved page as text. Invalid UTF-8 is replaced, never fatal.
pub fn read_html(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn epoch_secs(time: SystemTime) -> f64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
