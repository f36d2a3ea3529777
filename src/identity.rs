//! Identity resolution: which URL does a saved HTML file stand for?
//!
//! Extraction precedence, first hit wins:
//!
//! 1. the filename convention (`...[URL]_<percent-encoded url>`), or the legacy
//!    `twitter.com_<user>_status_<id>` form;
//! 2. `<link rel="canonical">`;
//! 3. a "saved from" marker comment left by page archivers;
//! 4. `<meta property="og:url">`;
//! 5. a synthetic `https://local/doc/<content hash>` URL.
//!
//! Every extracted string passes through [`tidy_extracted_url`]; a rejected
//! value falls through to the next tier. The accepted URL is then reduced to
//! its canonical key by [`normalize_url`].

use std::collections::HashSet;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::UrlNormConfig;
use crate::models::{FileRecord, ResolvedDocument, UrlSource};

static EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.html?$").expect("static regex"));
static TS_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_\d{8}_?\d{6}$").expect("static regex"));
static URL_MARK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[URL\]").expect("static regex"));
static LEGACY_SOCIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:x|twitter)\.com_([A-Za-z0-9_]+)_status_(\d+)").expect("static regex")
});
static DANGLING_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[0-9A-Fa-f]$").expect("static regex"));

static SAVED_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!--\s*saved from url=(?:\(\d+\))?\(?\s*([^)>\s]+)\s*\)?\s*-->")
        .expect("static regex")
});
static SINGLEFILE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--\s*Page saved with SingleFile.*?\burl:\s*(\S+)").expect("static regex")
});

static CANONICAL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="canonical"]"#).expect("static selector"));
static OG_URL_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:url"], meta[name="og:url"]"#).expect("static selector")
});
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));

/// Resolves files to canonical identities under one normalization policy.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    keep_params: HashSet<String>,
    drop_prefixes: Vec<String>,
}

impl IdentityResolver {
    pub fn new<K, D>(keep_params: K, drop_prefixes: D) -> Self
    where
        K: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        Self {
            keep_params: keep_params.into_iter().collect(),
            drop_prefixes: drop_prefixes.into_iter().collect(),
        }
    }

    pub fn from_config(config: &UrlNormConfig) -> Self {
        Self::new(
            config.keep_params.iter().cloned(),
            config.drop_params.iter().cloned(),
        )
    }

    pub fn normalize(&self, url: &str) -> String {
        normalize_url(url, &self.keep_params, &self.drop_prefixes)
    }

    /// Build the immutable document for `file` from its decoded `html`.
    ///
    /// CPU-bound (hashing + HTML parsing); callers on an async runtime should
    /// run it on a blocking thread.
    pub fn resolve(&self, file: FileRecord, html: String) -> ResolvedDocument {
        let content_hash = content_hash(&html);
        let document = Html::parse_document(&html);

        let (source_url, url_source) = infer_from_filename(&file.file_name())
            .or_else(|| choose_from_parsed(&html, &document))
            .unwrap_or_else(|| (synthetic_url(&content_hash), UrlSource::Synthetic));

        let normalized_url = self.normalize(&source_url);
        let local_title = title_of(&document);

        ResolvedDocument {
            file,
            html,
            source_url,
            url_source,
            normalized_url,
            content_hash,
            local_title,
        }
    }
}

/// Infer the source URL from a filename.
///
/// Accepted shapes:
///   `(Title)_[URL]_ENCODED_URL.html`
///   `Cleaned_Title_YYYYMMDD_HHMMSS_[URL]_ENCODED_URL.html`
///   `Cleaned Title YYYYMMDD_HHMMSS [URL] ENCODED_URL.html`
///   `twitter.com_<user>_status_<id>.html` (legacy)
///
/// The encoded tail may be cut short with `…` or end in a partial escape.
pub fn infer_from_filename(name: &str) -> Option<(String, UrlSource)> {
    let base = EXT_RE.replace(name, "");
    let base = TS_SUFFIX_RE.replace(&base, "");

    let Some(marker) = URL_MARK_RE.find(&base) else {
        return LEGACY_SOCIAL_RE.captures(&base).map(|caps| {
            (
                format!("https://x.com/{}/status/{}", &caps[1], &caps[2]),
                UrlSource::Inferred,
            )
        });
    };

    let tail = base[marker.end()..].trim_start_matches([' ', '_', '-']).trim();
    let tail = TS_SUFFIX_RE.replace(tail, "");
    let mut enc: &str = tail.trim_end_matches('…');
    loop {
        if enc.ends_with('%') || DANGLING_ESCAPE_RE.is_match(enc) {
            // Both cases end in an ASCII byte, so this stays on a char boundary.
            enc = &enc[..enc.len() - 1];
        } else {
            break;
        }
    }
    let enc = enc.trim();
    if enc.is_empty() {
        return None;
    }

    let decoded = percent_decode_str(enc).decode_utf8_lossy();
    tidy_extracted_url(&decoded)
        .or_else(|| tidy_extracted_url(enc))
        .map(|url| (url, UrlSource::Inferred))
}

/// Best URL signal from the HTML itself, already tidied.
pub fn choose_url_from_html(html: &str) -> Option<(String, UrlSource)> {
    let document = Html::parse_document(html);
    choose_from_parsed(html, &document)
}

fn choose_from_parsed(raw: &str, document: &Html) -> Option<(String, UrlSource)> {
    let canonical = document
        .select(&CANONICAL_SEL)
        .filter_map(|el| el.value().attr("href"))
        .map(|href| (href.to_string(), UrlSource::Canonical));

    let saved_from = SAVED_FROM_RE
        .captures(raw)
        .or_else(|| SINGLEFILE_HEADER_RE.captures(raw))
        .map(|caps| (caps[1].to_string(), UrlSource::SingleFile));

    let og_url = document
        .select(&OG_URL_SEL)
        .filter_map(|el| el.value().attr("content"))
        .map(|content| (content.to_string(), UrlSource::OgUrl));

    canonical
        .chain(saved_from)
        .chain(og_url)
        .find_map(|(candidate, source)| tidy_extracted_url(&candidate).map(|url| (url, source)))
}

/// Accept only strings that resolve to `scheme://host.with.dot/...`.
///
/// `//host/...`, `www.host/...` and `/www.host/...` are taken as https;
/// anything else is retried with an `https://` prefix.
pub fn tidy_extracted_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let lowered = raw.to_ascii_lowercase();
    let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        raw.to_string()
    } else if lowered.starts_with("//") {
        format!("https:{}", raw)
    } else {
        format!("https://{}", raw.trim_start_matches('/'))
    };

    let parsed = Url::parse(&candidate).ok()?;
    match parsed.host_str() {
        Some(host) if host.contains('.') => Some(parsed.to_string()),
        _ => None,
    }
}

/// Canonical dedup key for `url`.
///
/// Lower-cases scheme and host, defaults the path to `/`, drops the fragment,
/// keeps only allow-listed query keys that match no blocked prefix, and sorts
/// what remains. Unparseable input is returned unchanged.
pub fn normalize_url(url: &str, keep_params: &HashSet<String>, drop_prefixes: &[String]) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    parsed.set_fragment(None);

    let mut kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !drop_prefixes.iter().any(|p| key.starts_with(p.as_str())))
        .filter(|(key, _)| keep_params.contains(key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    kept.sort();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&kept);
    }
    parsed.to_string()
}

pub fn synthetic_url(content_hash: &str) -> String {
    format!("https://local/doc/{}", content_hash)
}

/// SHA-256 of the decoded HTML, hex encoded.
pub fn content_hash(html: &str) -> String {
    hex::encode(Sha256::digest(html.as_bytes()))
}

/// Trimmed `<title>` text, `None` when missing or blank.
pub fn extract_local_title(html: &str) -> Option<String> {
    title_of(&Html::parse_document(html))
}

pub(crate) fn title_of(document: &Html) -> Option<String> {
    let element = document.select(&TITLE_SEL).next()?;
    let text = element.text().collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
