//! # reader-sync
//!
//! Incremental, deduplicating sync of locally saved HTML pages to Readwise
//! Reader.
//!
//! Every file in a watch directory is resolved to the URL it was saved from,
//! reduced to a canonical key, and reconciled against a local SQLite state
//! store, so each page is created remotely once and afterwards only gets its
//! metadata refreshed. Calls to the service are rate limited per endpoint;
//! files that fail land in a per-day ledger that can be replayed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Watch dir   │──▶│  Identity    │──▶│ State store  │
//! │ (*.html)    │   │  resolver    │   │ (SQLite)     │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                   ┌──────────────┐   ┌──────▼───────┐
//!                   │ Failure      │◀──│ Orchestrator │
//!                   │ ledger (CSV) │   │ (sync)       │
//!                   └──────────────┘   └──────┬───────┘
//!                                             │
//!                                      ┌──────▼───────┐
//!                                      │ Reader API   │
//!                                      │ (rate limit) │
//!                                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export READWISE_TOKEN=...
//! rw-sync init                  # create state db and data dirs
//! rw-sync auth check            # verify the token
//! rw-sync push --new            # sync files added since the last run
//! rw-sync push --all --max 20   # re-push, refreshing metadata
//! rw-sync replay                # retry today's failures
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML settings and environment overrides |
//! | [`models`] | Core data types |
//! | [`identity`] | Source URL extraction and normalization |
//! | [`connector_fs`] | Watch directory discovery |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Per-URL sync state and watermark |
//! | [`ledger`] | Per-day failure ledger |
//! | [`client`] | Rate-limited Reader API client |
//! | [`title`] | Best-effort live title lookup |
//! | [`sync`] | Push and replay orchestration |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | State summary |
//! | [`logging`] | Log subscriber setup |

pub mod client;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod stats;
pub mod store;
pub mod sync;
pub mod title;
