//! Breadth-first site traversal.
//!
//! Two modes share one traversal skeleton. Discovery visits pages one at a
//! time with asset requests aborted, collecting metadata only. Capture
//! visits up to three pages in parallel and returns rendered HTML plus
//! enumerated resources for downloading.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::browser::{Browser, InterceptPolicy, WaitUntil};

use super::detector::{self, extract_content_links};
use super::error::CaptureError;
use super::extractor::{self, ExtractedResources};
use super::rewriter::effective_base_url;
use super::CaptureOptions;
use super::{MAX_PAGE_TIMEOUT_MS, MIN_PAGE_TIMEOUT_MS};

/// Estimated-size weights per counted resource, in bytes.
const IMAGE_WEIGHT: u64 = 50_000;
const CSS_WEIGHT: u64 = 20_000;
const JS_WEIGHT: u64 = 30_000;
const FONT_WEIGHT: u64 = 15_000;

/// Links retained per discovered page.
const MAX_LINKS_PER_PAGE: usize = 100;

/// Scrolls through the page to trigger lazy-loaded images, then returns to
/// the top.
const LAZY_SCROLL_SCRIPT: &str = r"
(async () => {
    const step = 500;
    const pause = (ms) => new Promise((resolve) => setTimeout(resolve, ms));
    const height = () => (document.body ? document.body.scrollHeight : 0);
    for (let y = 0; y < height(); y += step) {
        window.scrollTo(0, y);
        await pause(200);
    }
    window.scrollTo(0, 0);
    return true;
})()
";

/// Discovery crawl options (test crawls).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOptions {
    /// Crawl depth, clamped to [1, 10].
    pub depth: u32,
    /// Page limit, clamped to [1, 500].
    pub max_pages: usize,
    pub same_domain_only: bool,
    pub timeout_ms: u64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            depth: 2,
            max_pages: 100,
            same_domain_only: true,
            timeout_ms: 30_000,
        }
    }
}

impl DiscoveryOptions {
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.depth = self.depth.clamp(1, 10);
        self.max_pages = self.max_pages.clamp(1, 500);
        self.timeout_ms = self.timeout_ms.clamp(MIN_PAGE_TIMEOUT_MS, MAX_PAGE_TIMEOUT_MS);
        self
    }
}

/// Resources counted on a discovered page.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    pub images: usize,
    pub css: usize,
    pub js: usize,
    pub fonts: usize,
    pub links: usize,
}

/// Page metadata gathered during discovery; no assets are downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPage {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub depth: u32,
    pub resources: ResourceCounts,
    pub estimated_size: u64,
    pub selected: bool,
    /// Child links feeding BFS expansion.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub links: Vec<String>,
}

/// A page visited in capture mode: rendered HTML plus its resource set.
#[derive(Debug)]
pub struct CapturedPage {
    pub url: String,
    pub depth: u32,
    pub title: Option<String>,
    pub html: String,
    pub resources: ExtractedResources,
    pub links: Vec<String>,
    pub success: bool,
}

/// Breadth-first crawler over a shared browser.
pub struct BfsCrawler<'a> {
    browser: &'a dyn Browser,
}

impl<'a> BfsCrawler<'a> {
    #[must_use]
    pub fn new(browser: &'a dyn Browser) -> Self {
        Self { browser }
    }

    /// Discovery crawl: enumerate pages and their metadata.
    ///
    /// Checks `cancelled` at the top of every round and returns
    /// [`CaptureError::Cancelled`] when set. `on_page` fires as each page
    /// completes, for live progress reporting.
    pub async fn discover<F>(
        &self,
        seed: &Url,
        options: &DiscoveryOptions,
        cancelled: &AtomicBool,
        mut on_page: F,
    ) -> Result<Vec<DiscoveredPage>, CaptureError>
    where
        F: FnMut(&DiscoveredPage),
    {
        let options = options.clone().normalized();
        let seed_host = seed.host_str().map(str::to_string);
        let timeout = Duration::from_millis(options.timeout_ms);

        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let seed_key = detector::normalize_link(seed);
        visited.insert(seed_key.clone());
        queue.push_back((seed_key, 0));

        let mut pages = Vec::new();

        while let Some((url, depth)) = queue.pop_front() {
            if cancelled.load(Ordering::Relaxed) {
                return Err(CaptureError::Cancelled);
            }
            if pages.len() >= options.max_pages {
                break;
            }

            match self.discover_node(&url, depth, timeout).await {
                Ok(page) => {
                    if depth < options.depth {
                        enqueue_children(
                            &page.links,
                            depth,
                            options.depth,
                            options.same_domain_only,
                            seed_host.as_deref(),
                            &mut visited,
                            &mut queue,
                        );
                    }
                    on_page(&page);
                    pages.push(page);
                }
                Err(e) => {
                    // A failed page ends its branch, not the crawl.
                    warn!(url = %url, error = %e, "Discovery page failed");
                }
            }
        }

        Ok(pages)
    }

    /// Capture crawl: render each page and enumerate its resources.
    ///
    /// Processes up to `concurrency` pages in parallel. `on_progress`
    /// receives (pages processed, pages queued or processed).
    pub async fn capture<F>(
        &self,
        seed: &Url,
        options: &CaptureOptions,
        concurrency: usize,
        mut on_progress: F,
    ) -> Result<Vec<CapturedPage>, CaptureError>
    where
        F: FnMut(usize, usize),
    {
        let multi = &options.multi_page;
        let max_pages = if multi.enabled { multi.max_pages } else { 1 };
        let depth_limit = if multi.enabled { multi.depth } else { 0 };
        let seed_host = seed.host_str().map(str::to_string);
        let concurrency = concurrency.max(1);

        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let seed_key = detector::normalize_link(seed);
        visited.insert(seed_key.clone());
        queue.push_back((seed_key, 0));

        let mut pages: Vec<CapturedPage> = Vec::new();

        while !queue.is_empty() && pages.len() < max_pages {
            let take = concurrency.min(max_pages - pages.len()).min(queue.len());
            let batch: Vec<(String, u32)> = (0..take).filter_map(|_| queue.pop_front()).collect();

            let results = join_all(
                batch
                    .into_iter()
                    .map(|(url, depth)| self.capture_node(url, depth, options)),
            )
            .await;

            for page in results {
                if page.success && page.depth < depth_limit {
                    enqueue_children(
                        &page.links,
                        page.depth,
                        depth_limit,
                        multi.same_domain_only,
                        seed_host.as_deref(),
                        &mut visited,
                        &mut queue,
                    );
                }
                pages.push(page);
                on_progress(pages.len(), pages.len() + queue.len());
            }
        }

        Ok(pages)
    }

    async fn discover_node(
        &self,
        url: &str,
        depth: u32,
        timeout: Duration,
    ) -> Result<DiscoveredPage, CaptureError> {
        let page = self
            .browser
            .new_page()
            .await
            .map_err(|e| CaptureError::navigation(url, e.to_string()))?;

        let result = async {
            page.set_intercept_policy(InterceptPolicy::DocumentAndScript)
                .await
                .map_err(|e| CaptureError::navigation(url, e.to_string()))?;
            page.navigate(url, WaitUntil::DomContentLoaded, timeout)
                .await
                .map_err(|e| CaptureError::navigation(url, e.to_string()))?;

            let title = page.title().await.unwrap_or(None);
            let html = page
                .content()
                .await
                .map_err(|e| CaptureError::Extraction(e.to_string()))?;

            let page_url = Url::parse(url).map_err(|e| CaptureError::Extraction(e.to_string()))?;
            Ok(summarize_page(&html, &page_url, depth, title))
        }
        .await;

        if let Err(e) = page.close().await {
            debug!(url, "Failed to close discovery page: {e}");
        }
        result
    }

    async fn capture_node(&self, url: String, depth: u32, options: &CaptureOptions) -> CapturedPage {
        match self.try_capture_node(&url, depth, options).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url = %url, error = %e, "Page capture failed");
                CapturedPage {
                    url,
                    depth,
                    title: None,
                    html: String::new(),
                    resources: ExtractedResources::default(),
                    links: Vec::new(),
                    success: false,
                }
            }
        }
    }

    async fn try_capture_node(
        &self,
        url: &str,
        depth: u32,
        options: &CaptureOptions,
    ) -> Result<CapturedPage, CaptureError> {
        let timeout = Duration::from_millis(options.timeout_ms);
        let page = self
            .browser
            .new_page()
            .await
            .map_err(|e| CaptureError::navigation(url, e.to_string()))?;

        let result = async {
            if let Some(ref user_agent) = options.user_agent {
                page.set_user_agent(user_agent)
                    .await
                    .map_err(|e| CaptureError::navigation(url, e.to_string()))?;
            }
            page.navigate(url, WaitUntil::NetworkIdle, timeout)
                .await
                .map_err(|e| CaptureError::navigation(url, e.to_string()))?;

            let mut html = page
                .content()
                .await
                .map_err(|e| CaptureError::Extraction(e.to_string()))?;

            if has_lazy_images(&html) {
                if let Err(e) = page.evaluate(LAZY_SCROLL_SCRIPT).await {
                    debug!(url, "Lazy-load scroll failed: {e}");
                }
                html = page
                    .content()
                    .await
                    .map_err(|e| CaptureError::Extraction(e.to_string()))?;
            }

            let title = page.title().await.unwrap_or(None);
            let page_url = Url::parse(url).map_err(|e| CaptureError::Extraction(e.to_string()))?;
            let base_url = effective_base_url(&html, &page_url);
            let resources = extractor::extract_page_resources(&html, &base_url);

            let same_domain = options
                .multi_page
                .same_domain_only
                .then(|| page_url.host_str().map(str::to_string))
                .flatten();
            let links = extract_content_links(&html, &page_url, same_domain.as_deref()).links;

            Ok(CapturedPage {
                url: url.to_string(),
                depth,
                title,
                html,
                resources,
                links,
                success: true,
            })
        }
        .await;

        if let Err(e) = page.close().await {
            debug!(url, "Failed to close capture page: {e}");
        }
        result
    }
}

/// Shared child-enqueue policy: skip visited URLs, off-domain URLs when
/// restricted, and anything past the depth limit.
fn enqueue_children(
    links: &[String],
    parent_depth: u32,
    depth_limit: u32,
    same_domain_only: bool,
    seed_host: Option<&str>,
    visited: &mut HashSet<String>,
    queue: &mut VecDeque<(String, u32)>,
) {
    let child_depth = parent_depth + 1;
    if child_depth > depth_limit {
        return;
    }
    for link in links {
        let Ok(parsed) = Url::parse(link) else {
            continue;
        };
        if same_domain_only {
            if let Some(host) = seed_host {
                if parsed.host_str() != Some(host) {
                    continue;
                }
            }
        }
        let key = detector::normalize_link(&parsed);
        if visited.insert(key.clone()) {
            queue.push_back((key, child_depth));
        }
    }
}

/// Build a [`DiscoveredPage`] from rendered HTML. Pure.
#[must_use]
pub fn summarize_page(
    html: &str,
    page_url: &Url,
    depth: u32,
    title: Option<String>,
) -> DiscoveredPage {
    let document = Html::parse_document(html);

    let description = Selector::parse("meta[name=\"description\"]")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .and_then(|e| e.value().attr("content"))
                .map(str::to_string)
        })
        .filter(|d| !d.is_empty());

    let count = |selector: &str| -> usize {
        Selector::parse(selector)
            .map(|sel| document.select(&sel).count())
            .unwrap_or(0)
    };

    let images = count("img");
    let css = count("link[rel=\"stylesheet\"]");
    let js = count("script[src]");
    let fonts: usize = {
        let style_sel = Selector::parse("style").expect("static selector");
        document
            .select(&style_sel)
            .map(|s| s.text().collect::<String>().matches("@font-face").count())
            .sum()
    };

    let links = collect_page_links(&document, page_url);

    let resources = ResourceCounts {
        images,
        css,
        js,
        fonts,
        links: links.len(),
    };

    let estimated_size = html.len() as u64
        + IMAGE_WEIGHT * images as u64
        + CSS_WEIGHT * css as u64
        + JS_WEIGHT * js as u64
        + FONT_WEIGHT * fonts as u64;

    DiscoveredPage {
        url: page_url.to_string(),
        title: title.filter(|t| !t.is_empty()),
        description,
        depth,
        resources,
        estimated_size,
        selected: false,
        links,
    }
}

/// All followable page links, absolute, first 100 retained.
fn collect_page_links(document: &Html, page_url: &Url) -> Vec<String> {
    let anchor_sel = Selector::parse("a[href]").expect("static selector");
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let trimmed = href.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("javascript:")
            || trimmed.starts_with("mailto:")
            || trimmed.starts_with("tel:")
        {
            continue;
        }
        let Ok(resolved) = page_url.join(trimmed) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let normalized = detector::normalize_link(&resolved);
        if seen.insert(normalized.clone()) {
            links.push(normalized);
            if links.len() >= MAX_LINKS_PER_PAGE {
                break;
            }
        }
    }

    links
}

fn has_lazy_images(html: &str) -> bool {
    html.contains("loading=\"lazy\"")
        || html.contains("loading='lazy'")
        || html.contains("data-src")
        || html.contains("data-lazy")
}
