//! State store overview for `rw-sync stats`.
//!
//! Shows how many documents are tracked, how many reached the service, the
//! incremental watermark, and how many failures today's ledger holds.

use anyhow::Result;
use chrono::Local;

use crate::config::Config;
use crate::ledger::{ledger_path, read_failures};
use crate::store::StateStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = StateStore::open(&config.state.db_path).await?;
    let summary = store.summary().await?;
    let watermark = store.watermark().await?;
    store.close().await;

    let today = Local::now().date_naive();
    let ledger = ledger_path(config.failures_root(), today);
    let failures_today = read_failures(config.failures_root(), today)?.len();

    let db_size = std::fs::metadata(&config.state.db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("rw-sync State Stats");
    println!("===================");
    println!();
    println!("  Database:    {}", config.state.db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Watch dir:   {}", config.watch.dir.display());
    println!();
    println!("  Documents:   {}", summary.documents);
    println!(
        "  Synced:      {} / {}",
        summary.with_remote_id, summary.documents
    );
    println!("  With error:  {}", summary.with_error);
    println!(
        "  Last write:  {}",
        summary
            .last_updated_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Watermark:   {}",
        watermark
            .map(|w| format_ts_iso(w as i64))
            .unwrap_or_else(|| "unset".to_string())
    );
    println!();
    println!("  Failures today: {} ({})", failures_today, ledger.display());
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn timestamps_format_as_utc() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_ts_relative(chrono::Utc::now().timestamp()), "just now");
    }
}
