//! Sync orchestration: discovery → windowing → per-file reconcile → tally.
//!
//! # Run Lifecycle
//!
//! ```text
//! push --new                       push --all / --since / replay
//!   │                                 │
//!   ├─ window end = now               │
//!   ├─ window start = watermark       │
//!   ▼                                 ▼
//! discover ──► filter by add time ──► sort ascending ──► cap at --max
//!                                                          │
//!                       buffer_unordered(concurrency) ◄────┘
//!                          │
//!                          ├─ prepare    (blocking thread: read, resolve)
//!                          ├─ lookup     (state store)
//!                          ├─ classify   (create / update / skip)
//!                          └─ execute    (remote call, store write, ledger)
//!                          │
//!                          ▼
//!                  RunStatistics + watermark advance (push --new only)
//! ```
//!
//! A failure in one file never aborts the run; it is counted, logged, and
//! appended to today's failure ledger so `replay` can retry it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{ClientError, ClientSettings, ReaderClient, SavePayload, UpdatePayload};
use crate::config::Config;
use crate::connector_fs::{discover_files, file_record, read_html};
use crate::identity::IdentityResolver;
use crate::ledger::{append_failure, read_failures};
use crate::models::{
    FailureReason, FileRecord, RecordUpsert, ResolvedDocument, RunMode, RunStatistics,
    SyncAction, SyncOutcome, SyncRecord, TitleSource,
};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::store::StateStore;
use crate::title::TitleFetcher;

/// Options for one `push` invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushOptions {
    pub mode: RunMode,
    pub dry_run: bool,
    /// Process at most this many files (oldest first).
    pub max_items: Option<usize>,
    /// Inclusive lower bound on add time, epoch seconds. Bypasses the watermark.
    pub since: Option<f64>,
}

impl PushOptions {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            dry_run: false,
            max_items: None,
            since: None,
        }
    }

    /// Only `push --new` without an explicit `--since` reads and moves the watermark.
    pub fn is_incremental(&self) -> bool {
        self.mode == RunMode::New && self.since.is_none()
    }
}

/// Add-time bounds applied to discovered files.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanWindow {
    /// Exclusive lower bound (the stored watermark).
    pub after: Option<f64>,
    /// Inclusive lower bound (`--since`).
    pub not_before: Option<f64>,
    /// Inclusive upper bound (run start).
    pub until: Option<f64>,
}

impl ScanWindow {
    pub fn contains(&self, add_time: f64) -> bool {
        self.after.map_or(true, |t| add_time > t)
            && self.not_before.map_or(true, |t| add_time >= t)
            && self.until.map_or(true, |t| add_time <= t)
    }
}

/// Filter to `window`, order oldest first, then cap. Returns the capped list.
pub fn select_candidates(
    files: Vec<FileRecord>,
    window: &ScanWindow,
    max_items: Option<usize>,
) -> Vec<FileRecord> {
    let mut selected: Vec<FileRecord> = files
        .into_iter()
        .filter(|f| window.contains(f.add_time()))
        .collect();
    // Stable: equal add times keep discovery (path) order
    selected.sort_by(|a, b| a.add_time().total_cmp(&b.add_time()));
    if let Some(max) = max_items {
        selected.truncate(max);
    }
    selected
}

/// Watermark after an incremental run over `processed`.
///
/// The newest processed add time, or the window end when nothing was
/// processed, and never earlier than `previous`.
pub fn next_watermark(processed: &[FileRecord], window_end: f64, previous: Option<f64>) -> f64 {
    let candidate = processed
        .iter()
        .map(FileRecord::add_time)
        .reduce(f64::max)
        .unwrap_or(window_end);
    previous.map_or(candidate, |prev| candidate.max(prev))
}

/// Decide what to do with a document given its stored record.
pub fn classify(existing: Option<&SyncRecord>, mode: RunMode) -> SyncAction {
    match existing.and_then(|r| r.remote_id.as_ref()) {
        None => SyncAction::Create,
        Some(_) if mode == RunMode::New => SyncAction::Skip,
        Some(_) => SyncAction::Update,
    }
}

/// Metadata delta for an update.
///
/// A fetched live title is always sent. Otherwise the local title is sent
/// only when it differs from the stored one.
pub fn update_delta(
    remote_title: Option<&str>,
    local_title: Option<&str>,
    stored_title: Option<&str>,
) -> UpdatePayload {
    if let Some(title) = remote_title {
        return UpdatePayload {
            title: Some(title.to_string()),
        };
    }
    match local_title {
        Some(title) if Some(title) != stored_title => UpdatePayload {
            title: Some(title.to_string()),
        },
        _ => UpdatePayload::default(),
    }
}

/// Title to store after a create, with its provenance.
pub fn created_title(
    remote_title: Option<String>,
    reader_title: Option<String>,
    local_title: Option<String>,
) -> (Option<String>, TitleSource) {
    if let Some(title) = remote_title {
        (Some(title), TitleSource::Online)
    } else if let Some(title) = reader_title {
        (Some(title), TitleSource::Reader)
    } else if let Some(title) = local_title {
        (Some(title), TitleSource::Local)
    } else {
        (None, TitleSource::Unknown)
    }
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn is_create_success(status: u16) -> bool {
    matches!(status, 200 | 201)
}

fn is_update_success(status: u16) -> bool {
    matches!(status, 200 | 201 | 204)
}

pub struct SyncService {
    config: Config,
    store: StateStore,
    reader: ReaderClient,
    titles: TitleFetcher,
    resolver: Arc<IdentityResolver>,
    progress: Box<dyn SyncProgressReporter>,
}

impl SyncService {
    /// Build the client, title fetcher and store from `config`.
    ///
    /// Fails before touching the database when no token is configured.
    pub async fn new(config: Config, progress: Box<dyn SyncProgressReporter>) -> Result<Self> {
        let reader = ReaderClient::new(&config.token, &ClientSettings::from_config(&config))?;
        let titles = TitleFetcher::from_config(&config)?;
        let store = StateStore::open(&config.state.db_path).await?;
        Ok(Self::from_parts(config, store, reader, titles, progress))
    }

    pub fn from_parts(
        config: Config,
        store: StateStore,
        reader: ReaderClient,
        titles: TitleFetcher,
        progress: Box<dyn SyncProgressReporter>,
    ) -> Self {
        let resolver = Arc::new(IdentityResolver::from_config(&config.url_norm));
        Self {
            config,
            store,
            reader,
            titles,
            resolver,
            progress,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    pub async fn auth_check(&self) -> Result<bool, ClientError> {
        self.reader.auth_check().await
    }

    /// Scan the watch directory and sync every selected file.
    pub async fn push(&self, options: PushOptions) -> Result<RunStatistics> {
        let run = format!("push {}", options.mode);
        let incremental = options.is_incremental();

        // Captured before discovery so files landing mid-run wait for the next one
        let window_end = now_epoch();
        let previous = if incremental {
            self.store
                .watermark()
                .await
                .context("Failed to read watermark")?
        } else {
            None
        };
        let window = ScanWindow {
            after: previous,
            not_before: options.since,
            until: incremental.then_some(window_end),
        };

        self.progress.report(SyncProgressEvent::Discovering {
            run: run.clone(),
            dir: self.config.watch.dir.display().to_string(),
        });
        let discovered = {
            let watch = self.config.watch.clone();
            tokio::task::spawn_blocking(move || discover_files(&watch))
                .await
                .context("discovery task panicked")??
        };
        let discovered_count = discovered.len();
        let candidates: Vec<FileRecord> = discovered
            .into_iter()
            .filter(|f| window.contains(f.add_time()))
            .collect();
        let candidate_count = candidates.len();
        let files = select_candidates(candidates, &ScanWindow::default(), options.max_items);

        info!(
            mode = %options.mode,
            dry_run = options.dry_run,
            discovered = discovered_count,
            candidates = candidate_count,
            selected = files.len(),
            watermark = ?previous,
            "push starting"
        );
        self.progress.report(SyncProgressEvent::Selected {
            run: run.clone(),
            candidates: candidate_count as u64,
            selected: files.len() as u64,
        });

        let stats = self
            .dispatch(&run, &files, options.mode, options.dry_run)
            .await;

        if incremental && !options.dry_run {
            let mark = next_watermark(&files, window_end, previous);
            match self.store.set_watermark(mark).await {
                Ok(()) => debug!(watermark = mark, "watermark advanced"),
                Err(err) => warn!(error = %err, "failed to advance watermark"),
            }
        }

        info!(%stats, "push finished");
        Ok(stats)
    }

    /// Re-run every file recorded in the failure ledger for `date`.
    pub async fn replay(&self, date: NaiveDate, dry_run: bool) -> Result<RunStatistics> {
        let run = format!("replay {}", date.format("%Y-%m-%d"));
        let root = self.config.failures_root().to_path_buf();
        let entries = tokio::task::spawn_blocking(move || read_failures(&root, date))
            .await
            .context("ledger task panicked")?
            .context("Failed to read failure ledger")?;

        if entries.is_empty() {
            info!(%date, "no failures recorded");
            return Ok(RunStatistics::default());
        }

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for entry in entries {
            let path = self.config.watch.dir.join(&entry.file_name);
            if !seen.insert(path.clone()) {
                continue;
            }
            if !path.is_file() {
                warn!(file = %entry.file_name, url = %entry.url, "replay: file no longer exists");
                continue;
            }
            match file_record(&path) {
                Ok(record) => files.push(record),
                Err(err) => warn!(file = %entry.file_name, error = %err, "replay: cannot stat file"),
            }
        }

        info!(%date, files = files.len(), dry_run, "replay starting");
        self.progress.report(SyncProgressEvent::Selected {
            run: run.clone(),
            candidates: seen.len() as u64,
            selected: files.len() as u64,
        });

        let stats = self.dispatch(&run, &files, RunMode::All, dry_run).await;
        info!(%stats, "replay finished");
        Ok(stats)
    }

    async fn dispatch(
        &self,
        run: &str,
        files: &[FileRecord],
        mode: RunMode,
        dry_run: bool,
    ) -> RunStatistics {
        let total = files.len() as u64;
        let mut stats = RunStatistics::default();
        let mut outcomes = stream::iter(files.iter().cloned())
            .map(|file| self.process_file(file, mode, dry_run))
            .buffer_unordered(self.config.network.concurrency.max(1));

        let mut n = 0u64;
        while let Some(outcome) = outcomes.next().await {
            n += 1;
            stats.record(&outcome);
            self.progress.report(SyncProgressEvent::Processed {
                run: run.to_string(),
                n,
                total,
                outcome: outcome.label(),
            });
        }
        stats
    }

    async fn process_file(&self, file: FileRecord, mode: RunMode, dry_run: bool) -> SyncOutcome {
        let span = info_span!("file", path = %file.path.display());
        async move {
            let outcome = self.reconcile(file, mode, dry_run).await;
            if let SyncOutcome::Failed { reason } = &outcome {
                error!(%reason, "sync failed");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self, file: FileRecord, mode: RunMode, dry_run: bool) -> SyncOutcome {
        let ledger_name = self.ledger_name(&file.path);

        let document = match self.prepare(file).await {
            Ok(document) => document,
            Err(err) => {
                self.record_failure("", &ledger_name, dry_run).await;
                return SyncOutcome::failed(FailureReason::Preparation(format!("{:#}", err)));
            }
        };

        let existing = match self.store.lookup(&document.normalized_url).await {
            Ok(existing) => existing,
            Err(err) => {
                self.record_failure(&document.source_url, &ledger_name, dry_run)
                    .await;
                return SyncOutcome::failed(FailureReason::Store(err.to_string()));
            }
        };

        let action = classify(existing.as_ref(), mode);
        debug!(
            %action,
            url = %document.normalized_url,
            url_source = %document.url_source,
            "classified"
        );

        let job = Job {
            document: &document,
            ledger_name: &ledger_name,
            dry_run,
        };
        match (action, existing) {
            (SyncAction::Skip, Some(existing)) => self.execute_skip(&job, &existing).await,
            (SyncAction::Update, Some(existing)) => self.execute_update(&job, &existing).await,
            _ => self.execute_create(&job).await,
        }
    }

    /// Read and resolve on a blocking thread.
    async fn prepare(&self, file: FileRecord) -> Result<ResolvedDocument> {
        let resolver = Arc::clone(&self.resolver);
        tokio::task::spawn_blocking(move || -> Result<ResolvedDocument> {
            let html = read_html(&file.path)
                .with_context(|| format!("Failed to read {}", file.path.display()))?;
            Ok(resolver.resolve(file, html))
        })
        .await
        .context("preparation task panicked")?
    }

    async fn execute_skip(&self, job: &Job<'_>, existing: &SyncRecord) -> SyncOutcome {
        let doc = job.document;
        if job.dry_run {
            info!(url = %doc.normalized_url, "[dry-run] skip (already synced)");
            return SyncOutcome::Skipped;
        }

        let (title, title_source) = match &existing.title {
            Some(title) => (
                Some(title.clone()),
                existing.title_source.unwrap_or(TitleSource::Unknown),
            ),
            None => match &doc.local_title {
                Some(title) => (Some(title.clone()), TitleSource::Local),
                None => (None, TitleSource::Unknown),
            },
        };
        let upsert = RecordUpsert {
            title,
            title_source: Some(title_source),
            remote_id: existing.remote_id.clone(),
            last_status: existing.last_status,
            last_error: existing.last_error.clone(),
            ..self.base_upsert(doc)
        };
        if let Err(err) = self.store.upsert(&upsert).await {
            self.record_failure(&doc.source_url, job.ledger_name, false)
                .await;
            return SyncOutcome::failed(FailureReason::Store(err.to_string()));
        }

        info!(url = %doc.normalized_url, "skip (already synced)");
        SyncOutcome::Skipped
    }

    async fn execute_create(&self, job: &Job<'_>) -> SyncOutcome {
        let doc = job.document;
        if job.dry_run {
            info!(url = %doc.source_url, "[dry-run] create");
            return SyncOutcome::Created;
        }

        let remote_title = self.fetch_title(doc).await;
        let payload = SavePayload {
            url: doc.source_url.clone(),
            html: doc.html.clone(),
            should_clean_html: self.config.reader.should_clean_html,
            category: Some(self.config.reader.default_category.clone())
                .filter(|c| !c.is_empty()),
            title: remote_title.clone().or_else(|| doc.local_title.clone()),
        };

        let result = match self.reader.save(&payload).await {
            Ok(result) => result,
            Err(err) => {
                let message = err.to_string();
                self.record_failure(&payload.url, job.ledger_name, false)
                    .await;
                let upsert = RecordUpsert {
                    title: doc.local_title.clone(),
                    title_source: Some(if doc.local_title.is_some() {
                        TitleSource::Local
                    } else {
                        TitleSource::Unknown
                    }),
                    remote_id: None,
                    last_status: None,
                    last_error: Some(message.clone()),
                    ..self.base_upsert(doc)
                };
                if let Err(store_err) = self.store.upsert(&upsert).await {
                    warn!(error = %store_err, "failed to record transport error");
                }
                return SyncOutcome::failed(FailureReason::Transport(message));
            }
        };

        let status = result.status.as_u16();
        if !is_create_success(status) {
            return self.unexpected_status(job, status).await;
        }

        let body = result.body.unwrap_or_default();
        let (title, title_source) =
            created_title(remote_title, body.title(), doc.local_title.clone());
        let upsert = RecordUpsert {
            title,
            title_source: Some(title_source),
            remote_id: body.remote_id(),
            last_status: Some(status),
            last_error: None,
            ..self.base_upsert(doc)
        };
        if let Err(err) = self.store.upsert(&upsert).await {
            self.record_failure(&doc.source_url, job.ledger_name, false)
                .await;
            return SyncOutcome::failed(FailureReason::Store(err.to_string()));
        }

        info!(
            status,
            remote_id = upsert.remote_id.as_deref().unwrap_or("-"),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "saved"
        );
        if status == 201 {
            SyncOutcome::Created
        } else {
            SyncOutcome::Updated
        }
    }

    async fn execute_update(&self, job: &Job<'_>, existing: &SyncRecord) -> SyncOutcome {
        let doc = job.document;
        let Some(remote_id) = existing.remote_id.as_deref() else {
            return self.execute_create(job).await;
        };

        if job.dry_run {
            info!(url = %doc.normalized_url, remote_id, "[dry-run] update");
            return SyncOutcome::Updated;
        }

        let remote_title = self.fetch_title(doc).await;
        let delta = update_delta(
            remote_title.as_deref(),
            doc.local_title.as_deref(),
            existing.title.as_deref(),
        );
        if delta.is_empty() {
            info!(url = %doc.normalized_url, "no metadata changes");
            return SyncOutcome::Skipped;
        }

        let result = match self.reader.update(remote_id, &delta).await {
            Ok(result) => result,
            Err(err) => {
                let message = err.to_string();
                self.record_failure(&doc.source_url, job.ledger_name, false)
                    .await;
                if let Err(store_err) = self
                    .store
                    .update_status(&doc.normalized_url, None, Some(&message))
                    .await
                {
                    warn!(error = %store_err, "failed to record transport error");
                }
                return SyncOutcome::failed(FailureReason::Transport(message));
            }
        };

        let status = result.status.as_u16();
        if !is_update_success(status) {
            return self.unexpected_status(job, status).await;
        }

        let reader_title = result.body.as_ref().and_then(|b| b.title());
        let (title, title_source) = if let Some(title) = reader_title {
            (Some(title), TitleSource::Reader)
        } else if let Some(title) = delta.title.clone() {
            let source = if remote_title.is_some() {
                TitleSource::Online
            } else {
                TitleSource::Local
            };
            (Some(title), source)
        } else if let Some(title) = doc.local_title.clone() {
            (Some(title), TitleSource::Local)
        } else {
            (None, TitleSource::Unknown)
        };

        let upsert = RecordUpsert {
            title,
            title_source: Some(title_source),
            remote_id: Some(remote_id.to_string()),
            last_status: Some(status),
            last_error: None,
            ..self.base_upsert(doc)
        };
        if let Err(err) = self.store.upsert(&upsert).await {
            self.record_failure(&doc.source_url, job.ledger_name, false)
                .await;
            return SyncOutcome::failed(FailureReason::Store(err.to_string()));
        }

        info!(status, remote_id, "updated");
        SyncOutcome::Updated
    }

    async fn unexpected_status(&self, job: &Job<'_>, status: u16) -> SyncOutcome {
        let doc = job.document;
        let reason = FailureReason::UnexpectedStatus(status);
        self.record_failure(&doc.source_url, job.ledger_name, false)
            .await;
        if let Err(err) = self
            .store
            .update_status(&doc.normalized_url, Some(status), Some(&reason.to_string()))
            .await
        {
            warn!(error = %err, "failed to record status");
        }
        SyncOutcome::failed(reason)
    }

    async fn fetch_title(&self, doc: &ResolvedDocument) -> Option<String> {
        if doc.is_synthetic() {
            return None;
        }
        self.titles.fetch(&doc.source_url).await
    }

    fn base_upsert(&self, doc: &ResolvedDocument) -> RecordUpsert {
        RecordUpsert {
            normalized_url: doc.normalized_url.clone(),
            source_url: doc.source_url.clone(),
            title: None,
            title_source: None,
            file_path: doc.file.path.display().to_string(),
            file_mtime: doc.file.mtime,
            remote_id: None,
            last_status: None,
            last_error: None,
        }
    }

    /// Path relative to the watch directory, so replay can find it again.
    fn ledger_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.config.watch.dir)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
    }

    async fn record_failure(&self, url: &str, ledger_name: &str, dry_run: bool) {
        if dry_run {
            debug!(url, file = ledger_name, "[dry-run] failure not recorded");
            return;
        }
        let root: PathBuf = self.config.failures_root().to_path_buf();
        let url = url.to_string();
        let name = ledger_name.to_string();
        let date = Local::now().date_naive();
        match tokio::task::spawn_blocking(move || append_failure(&root, &url, &name, date)).await {
            Ok(Ok(path)) => debug!(ledger = %path.display(), "failure recorded"),
            Ok(Err(err)) => warn!(error = %err, "failed to append to failure ledger"),
            Err(err) => warn!(error = %err, "failure ledger task panicked"),
        }
    }
}

/// Per-file context threaded through the execute steps.
struct Job<'a> {
    document: &'a ResolvedDocument,
    ledger_name: &'a str,
    dry_run: bool,
}
