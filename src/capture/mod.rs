//! The capture pipeline: rate limiting, resource download, extraction,
//! rewriting, BFS crawling, and the orchestrator that binds them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod crawler;
pub mod detector;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod orchestrator;
pub mod rate_limiter;
pub mod rewriter;

pub use downloader::ResourceDownloader;
pub use error::CaptureError;
pub use orchestrator::Archiver;
pub use rate_limiter::DomainRateLimiter;

/// Minimum per-page navigation timeout in milliseconds.
pub const MIN_PAGE_TIMEOUT_MS: u64 = 5_000;

/// Maximum per-page navigation timeout in milliseconds.
pub const MAX_PAGE_TIMEOUT_MS: u64 = 120_000;

/// Capture options, normalized at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureOptions {
    /// Inline `<style>` blocks are preserved in the rewritten page.
    pub inline_styles: bool,
    /// Download PDF resources linked from the page.
    pub include_pdfs: bool,
    /// Per-page navigation timeout in milliseconds.
    pub timeout_ms: u64,
    pub multi_page: MultiPageOptions,
    /// User agent; filled from the realistic-browser pool when absent.
    pub user_agent: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Accepted for compatibility; the pipeline does not consume it.
    pub include_screenshot: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            inline_styles: true,
            include_pdfs: false,
            timeout_ms: 30_000,
            multi_page: MultiPageOptions::default(),
            user_agent: None,
            headers: BTreeMap::new(),
            include_screenshot: false,
        }
    }
}

impl CaptureOptions {
    /// Clamp every bounded field and fill the user agent from the pool.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.clamp(MIN_PAGE_TIMEOUT_MS, MAX_PAGE_TIMEOUT_MS);
        self.multi_page.depth = self.multi_page.depth.clamp(1, 3);
        self.multi_page.max_pages = self.multi_page.max_pages.clamp(1, 100);
        if self.user_agent.as_deref().map_or(true, str::is_empty) {
            self.user_agent = Some(crate::constants::random_user_agent().to_string());
        }
        self
    }
}

/// Multi-page crawl options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiPageOptions {
    pub enabled: bool,
    /// Crawl depth, clamped to [1, 3].
    pub depth: u32,
    /// Page limit, clamped to [1, 100].
    pub max_pages: usize,
    pub same_domain_only: bool,
}

impl Default for MultiPageOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            depth: 1,
            max_pages: 10,
            same_domain_only: true,
        }
    }
}

/// What kind of resource a URL refers to, deciding its archive bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Stylesheet,
    Script,
    Font,
    Favicon,
}

impl ResourceKind {
    /// Subdirectory of the capture this kind is stored under.
    ///
    /// The favicon lives at the capture root.
    #[must_use]
    pub fn bucket(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Stylesheet => "css",
            Self::Script => "js",
            Self::Font => "fonts",
            Self::Favicon => "",
        }
    }

    /// Stats key for this kind (`stats.succeeded.<kind>` etc.).
    #[must_use]
    pub fn stat_key(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Stylesheet => "stylesheets",
            Self::Script => "scripts",
            Self::Font => "fonts",
            Self::Favicon => "favicon",
        }
    }
}

/// A downloaded resource: where it came from and where its bytes landed.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Absolute URL as requested.
    pub url: String,
    /// Temp file holding the downloaded bytes.
    pub local_path: PathBuf,
    /// Archive filename (unique within the capture).
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub kind: ResourceKind,
}

impl ResourceDescriptor {
    /// Relative path of this resource inside the capture directory.
    #[must_use]
    pub fn archive_path(&self) -> String {
        let bucket = self.kind.bucket();
        if bucket.is_empty() {
            self.filename.clone()
        } else {
            format!("{bucket}/{}", self.filename)
        }
    }
}
