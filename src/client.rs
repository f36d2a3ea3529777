//! Rate-limited client for the Reader document API.
//!
//! Saves and updates draw from two independent per-minute budgets. A 429
//! response is honoured by sleeping for the advertised `Retry-After` before
//! the response is handed back; the request itself is not retried.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

pub const SAVE_PATH: &str = "/api/v3/save/";
pub const AUTH_PATH: &str = "/api/v2/auth/";

/// Shortest pause after a 429, also used when `Retry-After` is absent or unparseable.
const MIN_RETRY_AFTER_SECS: f64 = 1.0;
/// Longest pause honoured after a 429.
const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("READWISE_TOKEN is not set")]
    MissingToken,
    #[error("auth token is not a valid header value")]
    InvalidToken,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Connection and budget settings, usually taken from `[network]` and `[reader]`.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub rpm_save: u32,
    pub rpm_update: u32,
    pub max_idle_per_host: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        let net = &config.network;
        Self {
            base_url: config.reader.base_url.clone(),
            rpm_save: net.rpm_save,
            rpm_update: net.rpm_update,
            max_idle_per_host: net.concurrency.max(5),
            connect_timeout: Duration::from_secs_f64(net.connect_timeout_secs),
            request_timeout: Duration::from_secs_f64(net.request_timeout_secs),
            pool_idle_timeout: Duration::from_secs_f64(net.pool_idle_timeout_secs),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Body of a create call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavePayload {
    pub url: String,
    pub html: String,
    pub should_clean_html: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Body of a metadata update. Only changed fields are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdatePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl UpdatePayload {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
    }
}

/// Loosely typed service reply. Ids may come back as strings or numbers,
/// and every field is read independently of the others' shapes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReaderResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub document_id: Option<Value>,
    #[serde(default)]
    pub title: Option<Value>,
    #[serde(default)]
    pub document: Option<Value>,
}

impl ReaderResponse {
    fn embedded(&self, key: &str) -> Option<&Value> {
        self.document.as_ref().and_then(|d| d.get(key))
    }

    /// First of `id`, `document_id`, `document.id`.
    pub fn remote_id(&self) -> Option<String> {
        [
            self.id.as_ref(),
            self.document_id.as_ref(),
            self.embedded("id"),
        ]
        .into_iter()
        .flatten()
        .find_map(id_text)
    }

    /// Non-empty `title`, else non-empty `document.title`.
    pub fn title(&self) -> Option<String> {
        [
            self.title.as_ref(),
            self.embedded("title"),
        ]
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()))
        .map(str::to_string)
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct SaveResult {
    pub status: StatusCode,
    pub body: Option<ReaderResponse>,
    /// Wall time of the call, including any Retry-After pause.
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub status: StatusCode,
    pub body: Option<ReaderResponse>,
}

pub struct ReaderClient {
    http: Client,
    base_url: Url,
    save_limiter: DirectLimiter,
    update_limiter: DirectLimiter,
}

impl ReaderClient {
    pub fn new(token: &str, settings: &ClientSettings) -> Result<Self, ClientError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ClientError::MissingToken);
        }

        let mut auth = HeaderValue::from_str(&format!("Token {}", token))
            .map_err(|_| ClientError::InvalidToken)?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build()?;

        Ok(Self {
            http,
            base_url: Url::parse(&settings.base_url)?,
            save_limiter: RateLimiter::direct(per_minute(settings.rpm_save)),
            update_limiter: RateLimiter::direct(per_minute(settings.rpm_update)),
        })
    }

    /// Same as [`ReaderClient::new`] with default settings against `base_url`.
    pub fn with_base_url(base_url: &str, token: &str) -> Result<Self, ClientError> {
        let settings = ClientSettings {
            base_url: base_url.to_string(),
            ..ClientSettings::default()
        };
        Self::new(token, &settings)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `true` only when the service answers 204.
    pub async fn auth_check(&self) -> Result<bool, ClientError> {
        let response = self.http.get(self.endpoint(AUTH_PATH)?).send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), "auth check");
        Ok(status == StatusCode::NO_CONTENT)
    }

    pub async fn save(&self, payload: &SavePayload) -> Result<SaveResult, ClientError> {
        self.save_limiter.until_ready().await;
        let started = Instant::now();

        let response = self
            .http
            .post(self.endpoint(SAVE_PATH)?)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        self.honour_rate_limit(&response).await;
        let body = read_body(response).await?;

        let elapsed = started.elapsed();
        debug!(
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "save"
        );
        Ok(SaveResult {
            status,
            body,
            elapsed,
        })
    }

    pub async fn update(
        &self,
        remote_id: &str,
        payload: &UpdatePayload,
    ) -> Result<UpdateResult, ClientError> {
        self.update_limiter.until_ready().await;

        let path = format!("/api/v3/update/{}/", remote_id);
        let response = self
            .http
            .patch(self.endpoint(&path)?)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        self.honour_rate_limit(&response).await;
        let body = read_body(response).await?;

        debug!(status = status.as_u16(), remote_id, "update");
        Ok(UpdateResult { status, body })
    }

    async fn honour_rate_limit(&self, response: &Response) {
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return;
        }
        let raw = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok());
        let delay = retry_after_delay(raw);
        warn!(
            retry_after = raw.unwrap_or("-"),
            sleep_secs = delay.as_secs_f64(),
            "rate limited by service"
        );
        tokio::time::sleep(delay).await;
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }
}

fn per_minute(rpm: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(rpm).unwrap_or(NonZeroU32::MIN))
}

/// Seconds from a `Retry-After` header, clamped to `[1 s, 1 h]`.
pub(crate) fn retry_after_delay(raw: Option<&str>) -> Duration {
    let secs = raw
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(MIN_RETRY_AFTER_SECS, MAX_RETRY_AFTER_SECS))
        .unwrap_or(MIN_RETRY_AFTER_SECS);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(1))
}

/// Empty or non-JSON bodies read as `None`.
async fn read_body(response: Response) -> Result<Option<ReaderResponse>, ClientError> {
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(serde_json::from_slice(&bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> ReaderResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn retry_after_is_clamped_and_defaulted() {
        assert_eq!(retry_after_delay(Some("5")), Duration::from_secs(5));
        assert_eq!(retry_after_delay(Some(" 2.5 ")), Duration::from_millis(2500));
        assert_eq!(retry_after_delay(Some("0")), Duration::from_secs(1));
        assert_eq!(retry_after_delay(Some("-3")), Duration::from_secs(1));
        assert_eq!(retry_after_delay(Some("soon")), Duration::from_secs(1));
        assert_eq!(retry_after_delay(None), Duration::from_secs(1));
    }

    #[test]
    fn oversized_retry_after_is_capped() {
        assert_eq!(retry_after_delay(Some("1e20")), Duration::from_secs(3600));
        assert_eq!(retry_after_delay(Some("86400")), Duration::from_secs(3600));
        assert_eq!(retry_after_delay(Some("inf")), Duration::from_secs(1));
        assert_eq!(retry_after_delay(Some("NaN")), Duration::from_secs(1));
    }

    #[test]
    fn remote_id_prefers_top_level_fields() {
        assert_eq!(parse(json!({"id": "abc"})).remote_id().as_deref(), Some("abc"));
        assert_eq!(parse(json!({"id": 42})).remote_id().as_deref(), Some("42"));
        assert_eq!(
            parse(json!({"id": null, "document_id": "d1"}))
                .remote_id()
                .as_deref(),
            Some("d1")
        );
        assert_eq!(
            parse(json!({"document": {"id": "nested"}}))
                .remote_id()
                .as_deref(),
            Some("nested")
        );
        assert_eq!(parse(json!({"url": "x"})).remote_id(), None);
    }

    #[test]
    fn odd_document_shape_keeps_top_level_fields() {
        let body: ReaderResponse =
            serde_json::from_slice(br#"{"id":"abc","document":"x","title":"T"}"#).unwrap();
        assert_eq!(body.remote_id().as_deref(), Some("abc"));
        assert_eq!(body.title().as_deref(), Some("T"));

        let listed = parse(json!({"document": ["not", "an", "object"]}));
        assert_eq!(listed.remote_id(), None);
        assert_eq!(listed.title(), None);
    }

    #[test]
    fn title_skips_blank_values() {
        assert_eq!(parse(json!({"title": "T"})).title().as_deref(), Some("T"));
        assert_eq!(
            parse(json!({"title": "  ", "document": {"title": "Inner"}}))
                .title()
                .as_deref(),
            Some("Inner")
        );
        assert_eq!(parse(json!({"title": 3})).title(), None);
        assert_eq!(parse(json!({})).title(), None);
    }

    #[test]
    fn payloads_omit_absent_fields() {
        let save = SavePayload {
            url: "https://example.com/a".into(),
            html: "<html></html>".into(),
            should_clean_html: true,
            category: Some("article".into()),
            title: None,
        };
        let value = serde_json::to_value(&save).unwrap();
        assert_eq!(
            value,
            json!({
                "url": "https://example.com/a",
                "html": "<html></html>",
                "should_clean_html": true,
                "category": "article"
            })
        );

        assert!(UpdatePayload::default().is_empty());
        assert_eq!(serde_json::to_value(UpdatePayload::default()).unwrap(), json!({}));
    }

    #[test]
    fn blank_token_is_rejected() {
        assert!(matches!(
            ReaderClient::with_base_url("http://127.0.0.1:9", "  "),
            Err(ClientError::MissingToken)
        ));
    }
}
