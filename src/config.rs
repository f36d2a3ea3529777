//! Runtime settings: TOML file plus environment overrides.
//!
//! Every section is optional; a missing section falls back to the defaults
//! below. Relative paths resolve against the directory holding the config
//! file (or the current directory when no file is used). The auth token is
//! only ever read from the environment (`READWISE_TOKEN`).

use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the Reader API token.
pub const TOKEN_ENV: &str = "READWISE_TOKEN";
/// Environment override for `[watch].dir`.
pub const WATCH_DIR_ENV: &str = "RW_SYNC_WATCH_DIR";
/// Environment override for `[state].db_path`.
pub const DB_PATH_ENV: &str = "RW_SYNC_DB_PATH";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub url_norm: UrlNormConfig,
    /// Base directory for relative paths and the `data/` tree.
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(skip)]
    pub token: String,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_watch_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    /// Descend into symlinked directories and sync symlinked files.
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: default_watch_dir(),
            patterns: default_patterns(),
            follow_symlinks: false,
        }
    }
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("./inbox")
}
fn default_patterns() -> Vec<String> {
    vec!["*.html".to_string(), "*.htm".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/state/rw_sync.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_rpm")]
    pub rpm_save: u32,
    #[serde(default = "default_rpm")]
    pub rpm_update: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: f64,
    #[serde(default = "default_title_timeout")]
    pub title_fetch_timeout_secs: f64,
    #[serde(default = "default_true")]
    pub fetch_remote_titles: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rpm_save: default_rpm(),
            rpm_update: default_rpm(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            title_fetch_timeout_secs: default_title_timeout(),
            fetch_remote_titles: true,
        }
    }
}

fn default_concurrency() -> usize {
    6
}
fn default_rpm() -> u32 {
    50
}
fn default_connect_timeout() -> f64 {
    5.0
}
fn default_request_timeout() -> f64 {
    10.0
}
fn default_pool_idle_timeout() -> f64 {
    5.0
}
fn default_title_timeout() -> f64 {
    3.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub should_clean_html: bool,
    #[serde(default = "default_category")]
    pub default_category: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            should_clean_html: true,
            default_category: default_category(),
        }
    }
}

fn default_base_url() -> String {
    "https://readwise.io".to_string()
}
fn default_category() -> String {
    "article".to_string()
}

/// Query-parameter policy for URL normalization.
///
/// `drop_params` entries are key *prefixes* and always win over `keep_params`.
#[derive(Debug, Deserialize, Clone)]
pub struct UrlNormConfig {
    #[serde(default = "default_keep_params")]
    pub keep_params: Vec<String>,
    #[serde(default = "default_drop_params")]
    pub drop_params: Vec<String>,
}

impl Default for UrlNormConfig {
    fn default() -> Self {
        Self {
            keep_params: default_keep_params(),
            drop_params: default_drop_params(),
        }
    }
}

fn default_keep_params() -> Vec<String> {
    ["id", "p", "page", "s", "v", "t", "q"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_drop_params() -> Vec<String> {
    [
        "utm_", "gclid", "fbclid", "mkt_tok", "mc_cid", "mc_eid", "yclid", "spm", "ref",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Defaults rooted at `root`, with no token. Paths are resolved.
    pub fn for_root(root: &Path) -> Self {
        let mut config = Config {
            root: root.to_path_buf(),
            ..Config::default()
        };
        config.resolve_paths();
        config
    }

    /// Directory that holds the per-day failure ledgers' `data/` tree.
    pub fn failures_root(&self) -> &Path {
        &self.root
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Create the state, failure and watch directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.state.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let failures = self.root.join("data").join("failures");
        std::fs::create_dir_all(&failures)
            .with_context(|| format!("Failed to create {}", failures.display()))?;
        std::fs::create_dir_all(&self.watch.dir)
            .with_context(|| format!("Failed to create {}", self.watch.dir.display()))?;
        Ok(())
    }

    fn resolve_paths(&mut self) {
        self.watch.dir = absolutize(&self.root, &self.watch.dir);
        self.state.db_path = absolutize(&self.root, &self.state.db_path);
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path.strip_prefix(".").unwrap_or(path))
    }
}

/// Load settings from `path` (or defaults when `None`) and the process environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    load_config_from(path, |key| std::env::var(key).ok())
}

/// Same as [`load_config`] with an injectable environment lookup.
pub fn load_config_from<F>(path: Option<&Path>, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;

    let mut config = match path {
        Some(path) => {
            let path = absolutize(&cwd, path);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let mut config: Config =
                toml::from_str(&content).with_context(|| "Failed to parse config file")?;
            config.root = path.parent().map(Path::to_path_buf).unwrap_or(cwd);
            config.config_path = Some(path);
            config
        }
        None => Config {
            root: cwd,
            ..Config::default()
        },
    };
    config.resolve_paths();

    if let Some(dir) = env(WATCH_DIR_ENV).filter(|v| !v.trim().is_empty()) {
        config.watch.dir = absolutize(&config.root, Path::new(dir.trim()));
    }
    if let Some(db) = env(DB_PATH_ENV).filter(|v| !v.trim().is_empty()) {
        config.state.db_path = absolutize(&config.root, Path::new(db.trim()));
    }
    config.token = env(TOKEN_ENV).map(|t| t.trim().to_string()).unwrap_or_default();

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let net = &config.network;
    if net.concurrency == 0 {
        bail!("network.concurrency must be >= 1");
    }
    if net.rpm_save == 0 || net.rpm_update == 0 {
        bail!("network.rpm_save and network.rpm_update must be >= 1");
    }
    for (name, value) in [
        ("connect_timeout_secs", net.connect_timeout_secs),
        ("request_timeout_secs", net.request_timeout_secs),
        ("pool_idle_timeout_secs", net.pool_idle_timeout_secs),
        ("title_fetch_timeout_secs", net.title_fetch_timeout_secs),
    ] {
        if !(value.is_finite() && value > 0.0) {
            bail!("network.{} must be > 0", name);
        }
    }

    if config.watch.patterns.is_empty() {
        bail!("watch.patterns must contain at least one glob");
    }
    for pattern in &config.watch.patterns {
        Glob::new(pattern).with_context(|| format!("Invalid watch pattern: '{}'", pattern))?;
    }

    url::Url::parse(&config.reader.base_url)
        .with_context(|| format!("Invalid reader.base_url: '{}'", config.reader.base_url))?;

    Ok(())
}
