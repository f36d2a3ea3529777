//! # rw-sync CLI
//!
//! The `rw-sync` binary pushes locally saved HTML pages to Readwise Reader.
//!
//! ## Usage
//!
//! ```bash
//! rw-sync --config ./rw-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rw-sync init` | Create data directories and the state schema |
//! | `rw-sync auth check` | Verify `READWISE_TOKEN` against the service |
//! | `rw-sync push --new` | Sync files added since the last incremental run |
//! | `rw-sync push --all` | Sync every file, refreshing metadata of known ones |
//! | `rw-sync replay` | Retry the files in a day's failure ledger |
//! | `rw-sync stats` | Summarize the state store |
//!
//! ## Examples
//!
//! ```bash
//! # Preview what an incremental push would do
//! rw-sync --dry-run push --new
//!
//! # Re-push at most 50 files saved since March
//! rw-sync push --all --since 2024-03-01 --max 50
//!
//! # Retry yesterday's failures
//! rw-sync replay --date 2024-03-14
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{debug, info};

use reader_sync::config::{self, Config};
use reader_sync::logging;
use reader_sync::migrate;
use reader_sync::models::{RunMode, RunStatistics};
use reader_sync::progress::ProgressMode;
use reader_sync::stats;
use reader_sync::sync::{PushOptions, SyncService};

/// Environment variable naming the config file when `--config` is absent.
const CONFIG_ENV: &str = "RW_SYNC_CONFIG";
/// Config file picked up from the current directory when present.
const DEFAULT_CONFIG_FILE: &str = "rw-sync.toml";

/// rw-sync: incremental sync of saved HTML pages to Readwise Reader.
///
/// The auth token is read from `READWISE_TOKEN` (a `.env` file is honoured).
#[derive(Parser)]
#[command(
    name = "rw-sync",
    about = "Sync locally saved HTML pages to Readwise Reader",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `$RW_SYNC_CONFIG`, then `./rw-sync.toml` when it exists,
    /// otherwise built-in defaults rooted at the current directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Preview actions without calling the service or writing state.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Progress output on stderr: off, human, or json. Defaults to human on a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directories and state database. Idempotent.
    Init,

    /// Authentication helpers.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Push files from the watch directory.
    ///
    /// `--new` only creates documents never saved before and, without
    /// `--since`, scans incrementally from the last run. `--all` also
    /// refreshes metadata of documents already saved.
    #[command(group(ArgGroup::new("mode").required(true).args(["all", "new"])))]
    Push {
        /// Push every matching file.
        #[arg(long)]
        all: bool,

        /// Push only files not yet saved.
        #[arg(long)]
        new: bool,

        /// Maximum number of files to process (oldest first).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        max: Option<u64>,

        /// Only process files added on or after this local time
        /// (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS).
        #[arg(long, value_parser = parse_since)]
        since: Option<f64>,
    },

    /// Retry files recorded in a day's failure ledger.
    Replay {
        /// Ledger date (YYYY-MM-DD). Defaults to today.
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },

    /// Show a summary of the state store.
    Stats,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Check that the token is accepted (expects 204).
    Check,
}

/// Parse `--since` as local time into epoch seconds.
fn parse_since(s: &str) -> Result<f64, String> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| format!("invalid date '{}': expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS", s))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("'{}' does not exist in the local time zone", s))?;
    Ok(local.timestamp_micros() as f64 / 1_000_000.0)
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{}': expected YYYY-MM-DD", s))
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| {
            std::env::var(CONFIG_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .or_else(|| {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            default.exists().then(|| default.to_path_buf())
        })
}

fn print_tally(label: &str, stats: &RunStatistics) {
    println!("{}", label);
    println!("  created: {}", stats.created);
    println!("  updated: {}", stats.updated);
    println!("  skipped: {}", stats.skipped);
    println!("  failed:  {}", stats.failed);
    println!("ok");
}

async fn open_service(cfg: Config, progress: ProgressMode) -> Result<SyncService> {
    SyncService::new(cfg, progress.reporter())
        .await
        .context("Failed to start sync service")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let config_path = resolve_config_path(cli.config);
    let cfg = config::load_config(config_path.as_deref())?;
    cfg.ensure_dirs()?;
    debug!(
        config = %cfg
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string()),
        watch_dir = %cfg.watch.dir.display(),
        "configuration loaded"
    );
    if cli.dry_run {
        info!("running in dry-run mode");
    }
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!(
                "State initialized at {} (watching {}).",
                cfg.state.db_path.display(),
                cfg.watch.dir.display()
            );
        }
        Commands::Auth {
            action: AuthAction::Check,
        } => {
            let service = open_service(cfg, progress).await?;
            let ok = service.auth_check().await;
            service.close().await;
            match ok {
                Ok(true) => println!("Auth OK (204)"),
                Ok(false) => {
                    eprintln!("Auth failed");
                    std::process::exit(1);
                }
                Err(err) => {
                    eprintln!("Auth failed: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Commands::Push {
            all,
            new: _,
            max,
            since,
        } => {
            let mode = if all { RunMode::All } else { RunMode::New };
            let options = PushOptions {
                mode,
                dry_run: cli.dry_run,
                max_items: max.map(|m| m as usize),
                since,
            };
            let service = open_service(cfg, progress).await?;
            let result = service.push(options).await;
            service.close().await;
            let stats = result?;
            print_tally(&format!("push {}", mode), &stats);
        }
        Commands::Replay { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let service = open_service(cfg, progress).await?;
            let result = service.replay(date, cli.dry_run).await;
            service.close().await;
            let stats = result?;
            print_tally(&format!("replay {}", date.format("%Y-%m-%d")), &stats);
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
