//! Push and replay progress reporting.
//!
//! Progress goes to **stderr** so the final tally on stdout stays parseable.
//! A reporter is handed to the orchestrator at construction time; it never
//! touches global state.

use std::io::Write;

/// A single progress event emitted by the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Walking the watch directory. Total unknown.
    Discovering { run: String, dir: String },
    /// Candidates left after windowing, and how many will be processed.
    Selected {
        run: String,
        candidates: u64,
        selected: u64,
    },
    /// One file finished: n of total, with its outcome label.
    Processed {
        run: String,
        n: u64,
        total: u64,
        outcome: &'static str,
    },
}

/// Receives progress events. Implementations must be cheap and non-blocking.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "push new  processed  12 / 1,024 files (created)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { run, dir } => {
                format!("{}  discovering {}...\n", run, dir)
            }
            SyncProgressEvent::Selected {
                run,
                candidates,
                selected,
            } => format!(
                "{}  selected  {} of {} candidate files\n",
                run,
                format_number(*selected),
                format_number(*candidates)
            ),
            SyncProgressEvent::Processed {
                run,
                n,
                total,
                outcome,
            } => format!(
                "{}  processed  {} / {} files ({})\n",
                run,
                format_number(*n),
                format_number(*total),
                outcome
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { run, dir } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "discovering",
                "dir": dir
            }),
            SyncProgressEvent::Selected {
                run,
                candidates,
                selected,
            } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "selected",
                "candidates": candidates,
                "selected": selected
            }),
            SyncProgressEvent::Processed {
                run,
                n,
                total,
                outcome,
            } => serde_json::json!({
                "event": "progress",
                "run": run,
                "phase": "processing",
                "n": n,
                "total": total,
                "outcome": outcome
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
