//! Per-day, append-only ledger of files that failed to sync.
//!
//! Layout: `<root>/data/failures/YYYYMMDD/failed_urls.csv` with header
//! `url,file_name`, guarded by an advisory lock on `failed_urls.csv.lock` so
//! appenders in this process and in other processes never interleave rows.
//! Rows are never rewritten or removed by the tool.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LEDGER_FILE: &str = "failed_urls.csv";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub url: String,
    pub file_name: String,
}

impl FailureEntry {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
        }
    }
}

pub fn ledger_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join("data")
        .join("failures")
        .join(date.format("%Y%m%d").to_string())
        .join(LEDGER_FILE)
}

fn lock_path(ledger: &Path) -> PathBuf {
    let mut name = ledger.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock(ledger: &Path) -> Result<File, LedgerError> {
    if let Some(parent) = ledger.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(ledger))?)
}

/// Append one `(url, file_name)` row to the ledger for `date`.
///
/// Creates the file (with header) on first use. Blocks while another writer
/// holds the lock.
pub fn append_failure(
    root: &Path,
    url: &str,
    file_name: &str,
    date: NaiveDate,
) -> Result<PathBuf, LedgerError> {
    let path = ledger_path(root, date);
    let lock = open_lock(&path)?;
    lock.lock_exclusive()?;

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(["url", "file_name"])?;
    }
    writer.write_record([url, file_name])?;
    writer.flush()?;

    // Lock released when `lock` drops
    Ok(path)
}

/// Entries for `date` in insertion order. A missing ledger reads as empty.
///
/// Rows without a file name cannot be replayed and are skipped.
pub fn read_failures(root: &Path, date: NaiveDate) -> Result<Vec<FailureEntry>, LedgerError> {
    let path = ledger_path(root, date);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let lock = open_lock(&path)?;
    lock.lock_shared()?;

    let mut reader = csv::Reader::from_path(&path)?;
    let mut entries = Vec::new();
    for row in reader.deserialize::<FailureEntry>() {
        let entry = row?;
        if entry.file_name.is_empty() {
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}
