//! Core data types that flow through a sync run.
//!
//! A [`FileRecord`] is produced by discovery, turned into a
//! [`ResolvedDocument`] by the identity resolver, reconciled against a
//! persisted [`SyncRecord`], and finally reduced to a [`SyncOutcome`] that
//! feeds the run's [`RunStatistics`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A candidate file seen during one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Modification time, epoch seconds.
    pub mtime: f64,
    pub size: u64,
    /// Creation time when the filesystem exposes one, epoch seconds.
    pub birthtime: Option<f64>,
}

impl FileRecord {
    /// Creation time if known, else modification time.
    pub fn add_time(&self) -> f64 {
        self.birthtime.unwrap_or(self.mtime)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Which heuristic produced a document's source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSource {
    Canonical,
    SingleFile,
    OgUrl,
    Inferred,
    Synthetic,
}

impl UrlSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlSource::Canonical => "canonical",
            UrlSource::SingleFile => "singlefile",
            UrlSource::OgUrl => "og:url",
            UrlSource::Inferred => "inferred",
            UrlSource::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for UrlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a stored title came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleSource {
    Online,
    Reader,
    Local,
    Unknown,
}

impl TitleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TitleSource::Online => "online",
            TitleSource::Reader => "reader",
            TitleSource::Local => "local",
            TitleSource::Unknown => "unknown",
        }
    }

    /// Unrecognised values read back from the store map to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "online" => TitleSource::Online,
            "reader" => TitleSource::Reader,
            "local" => TitleSource::Local,
            _ => TitleSource::Unknown,
        }
    }
}

impl fmt::Display for TitleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file after identity resolution. Immutable once built.
#[derive(Debug, Clone)]
pub struct ResolvedDocument {
    pub file: FileRecord,
    pub html: String,
    pub source_url: String,
    pub url_source: UrlSource,
    pub normalized_url: String,
    pub content_hash: String,
    pub local_title: Option<String>,
}

impl ResolvedDocument {
    pub fn is_synthetic(&self) -> bool {
        self.url_source == UrlSource::Synthetic
    }
}

/// Persisted sync state for one normalized URL.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub normalized_url: String,
    pub source_url: String,
    pub title: Option<String>,
    pub title_source: Option<TitleSource>,
    pub file_path: String,
    pub file_mtime: f64,
    pub remote_id: Option<String>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Field values for a merge-or-insert into the state store.
///
/// A `None` remote id never clears a previously stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpsert {
    pub normalized_url: String,
    pub source_url: String,
    pub title: Option<String>,
    pub title_source: Option<TitleSource>,
    pub file_path: String,
    pub file_mtime: f64,
    pub remote_id: Option<String>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

/// Action the orchestrator decided for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    Update,
    Skip,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Skip => "skip",
        })
    }
}

/// Run mode: `All` re-pushes everything, `New` only files never saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    New,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::All => "all",
            RunMode::New => "new",
        })
    }
}

/// Why a single file failed to sync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("preparation failed: {0}")]
    Preparation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("state store error: {0}")]
    Store(String),
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Skipped,
    Failed { reason: FailureReason },
}

impl SyncOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        SyncOutcome::Failed { reason }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "created",
            SyncOutcome::Updated => "updated",
            SyncOutcome::Skipped => "skipped",
            SyncOutcome::Failed { .. } => "failed",
        }
    }
}

/// Tally of outcomes for one invocation. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunStatistics {
    pub fn record(&mut self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Skipped => self.skipped += 1,
            SyncOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} failed={}",
            self.created, self.updated, self.skipped, self.failed
        )
    }
}
