//! Best-effort lookup of a page's live `<title>`.
//!
//! Used to give newly created documents a better title than the one saved
//! in the local copy. Every failure (timeout, non-2xx, no title) reads as
//! "no title" and is only logged at debug level.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::Config;
use crate::identity::extract_local_title;

const USER_AGENT: &str = concat!("rw-sync/", env!("CARGO_PKG_VERSION"));

/// Only the start of a page is read; `<title>` lives in the head.
pub const MAX_TITLE_BODY_BYTES: usize = 256 * 1024;

pub struct TitleFetcher {
    http: Client,
    enabled: bool,
}

impl TitleFetcher {
    pub fn new(timeout: Duration, enabled: bool) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, enabled })
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(
            Duration::from_secs_f64(config.network.title_fetch_timeout_secs),
            config.network.fetch_remote_titles,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The trimmed `<title>` of `url`, or `None` on any failure.
    pub async fn fetch(&self, url: &str) -> Option<String> {
        if !self.enabled || url.is_empty() {
            return None;
        }
        match self.try_fetch(url).await {
            Ok(title) => title,
            Err(err) => {
                debug!(url, error = %err, "remote title fetch failed");
                None
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<Option<String>, reqwest::Error> {
        let mut response = self.http.get(url).send().await?.error_for_status()?;

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_TITLE_BODY_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_TITLE_BODY_BYTES {
                break;
            }
        }

        let parsed = tokio::task::spawn_blocking(move || {
            extract_local_title(&String::from_utf8_lossy(&body))
        })
        .await;
        match parsed {
            Ok(title) => Ok(title),
            Err(err) => {
                debug!(url, error = %err, "title parse task failed");
                Ok(None)
            }
        }
    }
}
