//! Server-side resource downloading with per-capture deduplication.
//!
//! Resources are fetched outside the browser, so cross-origin assets come
//! down without CORS restrictions. Bytes land in a per-session temp
//! directory; the capture store copies them into their final buckets.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use super::error::CaptureError;
use super::rate_limiter::DomainRateLimiter;
use super::{ResourceDescriptor, ResourceKind};

/// Resource GET timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Stylesheet text fetch timeout (font extraction).
const STYLESHEET_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts made by [`ResourceDownloader::download_with_retry`].
pub const DEFAULT_RETRIES: u32 = 3;

/// Basenames that are generic dispatchers: the query string selects the
/// content, so the filename must incorporate it.
const DISPATCHER_BASENAMES: &[&str] = &["load.php", "index.php", "api.php", "script.php"];

/// Longest generated filename.
const MAX_FILENAME_LEN: usize = 100;

/// A download that failed after retries.
#[derive(Debug, Clone)]
pub struct FailedDownload {
    pub url: String,
    pub kind: ResourceKind,
    pub error: String,
}

/// Partitioned outcome of a bulk download.
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    pub succeeded: Vec<ResourceDescriptor>,
    pub failed: Vec<FailedDownload>,
}

#[derive(Default)]
struct SessionState {
    /// URL → descriptor for everything fetched this session.
    cache: HashMap<String, ResourceDescriptor>,
    /// Filenames already allocated this session.
    used_filenames: HashSet<String>,
}

/// Rate-limited resource downloader scoped to one capture session.
pub struct ResourceDownloader {
    client: reqwest::Client,
    base_url: Option<Url>,
    rate_limiter: Arc<DomainRateLimiter>,
    temp_dir: PathBuf,
    batch_size: usize,
    state: Mutex<SessionState>,
}

impl ResourceDownloader {
    /// Create a downloader writing into `temp_dir` (created on demand).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: Option<Url>,
        temp_dir: PathBuf,
        rate_limiter: Arc<DomainRateLimiter>,
        user_agent: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            rate_limiter,
            temp_dir,
            batch_size: batch_size.max(1),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Resolve a raw reference to an absolute URL.
    ///
    /// Scheme-relative (`//host/x`) promotes to https; root- and
    /// path-relative references resolve against the base URL. Relative
    /// input without a base fails fast.
    pub fn normalize_url(&self, raw: &str) -> Result<Url, CaptureError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CaptureError::download(raw, "empty URL"));
        }

        if let Some(rest) = raw.strip_prefix("//") {
            return Url::parse(&format!("https://{rest}"))
                .map_err(|e| CaptureError::download(raw, e.to_string()));
        }

        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base
                    .join(raw)
                    .map_err(|e| CaptureError::download(raw, e.to_string())),
                None => Err(CaptureError::download(
                    raw,
                    "relative URL without a base URL",
                )),
            },
            Err(e) => Err(CaptureError::download(raw, e.to_string())),
        }
    }

    /// Download one resource, deduplicating within the session.
    ///
    /// A 429 response with `Retry-After` is honored and retried once.
    /// Other failures surface as [`CaptureError::Download`].
    pub async fn download(
        &self,
        raw_url: &str,
        kind: ResourceKind,
    ) -> Result<ResourceDescriptor, CaptureError> {
        let url = self.normalize_url(raw_url)?;
        let key = url.to_string();

        if let Some(cached) = self.state.lock().await.cache.get(&key) {
            debug!(url = %key, "Resource already downloaded this session");
            return Ok(cached.clone());
        }

        let response = self.get_with_rate_limit(&url).await?;
        let response = if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(value) = retry_after {
                warn!(url = %key, retry_after = %value, "Rate limited, honoring Retry-After");
                self.rate_limiter.handle_retry_after(&value).await;
            }
            self.get_with_rate_limit(&url).await?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(CaptureError::download(
                &key,
                format!("HTTP status {}", response.status()),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| "application/octet-stream".to_string(), normalize_mime);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CaptureError::download(&key, e.to_string()))?;

        let filename = {
            let mut state = self.state.lock().await;
            let filename = unique_filename(&url, &content_type, &state.used_filenames);
            state.used_filenames.insert(filename.clone());
            filename
        };

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| CaptureError::download(&key, format!("temp dir: {e}")))?;
        let local_path = self.temp_dir.join(&filename);
        tokio::fs::write(&local_path, &bytes)
            .await
            .map_err(|e| CaptureError::download(&key, format!("write temp file: {e}")))?;

        let descriptor = ResourceDescriptor {
            url: key.clone(),
            local_path,
            filename,
            content_type,
            size: bytes.len() as u64,
            kind,
        };

        debug!(url = %key, file = %descriptor.filename, size = descriptor.size, "Resource downloaded");
        self.state
            .lock()
            .await
            .cache
            .insert(key, descriptor.clone());
        Ok(descriptor)
    }

    /// Download with up to `attempts` tries, backing off 1 s × attempt.
    pub async fn download_with_retry(
        &self,
        raw_url: &str,
        kind: ResourceKind,
        attempts: u32,
    ) -> Result<ResourceDescriptor, CaptureError> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.download(raw_url, kind).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) => {
                    debug!(url = %raw_url, attempt, error = %e, "Download attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CaptureError::download(raw_url, "no attempts made")))
    }

    /// Download many resources in parallel batches, partitioning results.
    pub async fn download_batch(&self, requests: Vec<(String, ResourceKind)>) -> DownloadOutcome {
        let results = stream::iter(requests.into_iter().map(|(url, kind)| async move {
            let result = self.download_with_retry(&url, kind, DEFAULT_RETRIES).await;
            (url, kind, result)
        }))
        .buffer_unordered(self.batch_size)
        .collect::<Vec<_>>()
        .await;

        let mut outcome = DownloadOutcome::default();
        for (url, kind, result) in results {
            match result {
                Ok(descriptor) => outcome.succeeded.push(descriptor),
                Err(e) => outcome.failed.push(FailedDownload {
                    url,
                    kind,
                    error: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Fetch a stylesheet's text without persisting it (font extraction).
    pub async fn fetch_text(&self, raw_url: &str) -> Result<String, CaptureError> {
        let url = self.normalize_url(raw_url)?;
        self.rate_limiter.wait_for_domain(url.as_str()).await;

        let response = self
            .client
            .get(url.clone())
            .timeout(STYLESHEET_TIMEOUT)
            .send()
            .await
            .map_err(|e| CaptureError::download(url.as_str(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(CaptureError::download(
                url.as_str(),
                format!("HTTP status {}", response.status()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| CaptureError::download(url.as_str(), e.to_string()))
    }

    async fn get_with_rate_limit(&self, url: &Url) -> Result<reqwest::Response, CaptureError> {
        self.rate_limiter.wait_for_domain(url.as_str()).await;
        self.client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CaptureError::download(url.as_str(), e.to_string()))
    }
}

/// Strip parameters from a MIME type (`text/css; charset=utf-8` → `text/css`).
fn normalize_mime(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or(value)
        .trim()
        .to_ascii_lowercase()
}

/// Generate a filename for `url`, then force uniqueness against `used` by
/// appending an MD5 suffix on collision.
fn unique_filename(url: &Url, content_type: &str, used: &HashSet<String>) -> String {
    let candidate = filename_for(url, content_type);
    if !used.contains(&candidate) {
        return candidate;
    }

    let (stem, ext) = split_extension(&candidate);
    format!("{stem}_{}{ext}", url_hash(url, 8))
}

/// Derive an archive filename from a URL per the naming rules:
/// sanitized basename, dispatcher basenames get an MD5 suffix and a
/// content-type extension, extension-less URLs fall back to a hashed name,
/// and the result is capped at 100 characters preserving the extension.
fn filename_for(url: &Url, content_type: &str) -> String {
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let sanitized = sanitize(basename);

    // Generic dispatcher with a query: the query picks the payload, so the
    // name must too.
    if DISPATCHER_BASENAMES.contains(&sanitized.as_str()) && url.query().is_some() {
        let stem = sanitized.split('.').next().unwrap_or(&sanitized);
        let ext = extension_for_content_type(content_type).unwrap_or_default();
        return cap_length(&format!("{stem}_{}{ext}", url_hash(url, 8)));
    }

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_' || c == '.') {
        let ext = extension_for_content_type(content_type).unwrap_or_default();
        return format!("resource_{}{ext}", url_hash(url, 12));
    }

    if !sanitized.contains('.') {
        if let Some(ext) = extension_for_content_type(content_type) {
            return cap_length(&format!("{sanitized}{ext}"));
        }
        return cap_length(&format!("resource_{}", url_hash(url, 12)));
    }

    cap_length(&sanitized)
}

/// Keep `[A-Za-z0-9._-]`; everything else becomes `_`. The query string is
/// never part of the basename.
fn sanitize(basename: &str) -> String {
    basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn cap_length(filename: &str) -> String {
    if filename.len() <= MAX_FILENAME_LEN {
        return filename.to_string();
    }
    let (stem, ext) = split_extension(filename);
    let keep = MAX_FILENAME_LEN.saturating_sub(ext.len()).max(1);
    let stem: String = stem.chars().take(keep).collect();
    format!("{stem}{ext}")
}

/// Split into (stem, extension-including-dot).
fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    }
}

fn url_hash(url: &Url, len: usize) -> String {
    let digest = format!("{:x}", md5::compute(url.as_str().as_bytes()));
    digest[..len.min(digest.len())].to_string()
}

fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = normalize_mime(content_type);
    let ext = match mime.as_str() {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "image/avif" => ".avif",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "text/css" => ".css",
        "application/javascript" | "text/javascript" | "application/x-javascript" => ".js",
        "font/woff2" | "application/font-woff2" => ".woff2",
        "font/woff" | "application/font-woff" => ".woff",
        "font/ttf" | "application/x-font-ttf" | "font/sfnt" => ".ttf",
        "font/otf" | "application/x-font-otf" => ".otf",
        "application/vnd.ms-fontobject" => ".eot",
        "text/html" => ".html",
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        _ => return None,
    };
    Some(ext)
}
