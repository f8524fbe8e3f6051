//! Content-region detection and outbound link extraction.
//!
//! Crawls should follow links from the primary content of a page, not its
//! navigation chrome. A priority list of selectors locates the content
//! container; a second list marks subtrees whose links are noise.

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

/// Content container selectors, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=\"main\"]",
    "#main-content",
    ".main-content",
    "#content",
    ".content",
    ".post-content",
    ".entry-content",
    ".article-body",
    "#primary",
];

/// Navigation-chrome selectors whose subtrees are excluded.
const EXCLUSION_SELECTORS: &[&str] = &[
    "nav",
    "header",
    "footer",
    "aside",
    "[role=\"navigation\"]",
    "[role=\"banner\"]",
    "[role=\"complementary\"]",
    "[role=\"contentinfo\"]",
    ".menu",
    ".navbar",
    ".sidebar",
    ".breadcrumb",
    ".breadcrumbs",
];

/// Links found in the content region plus extraction diagnostics.
#[derive(Debug, Clone)]
pub struct ContentLinks {
    /// Absolute, deduplicated HTTP(S) URLs.
    pub links: Vec<String>,
    /// Selector that matched the content container, if any.
    pub container: Option<&'static str>,
    /// Anchors dropped because they sat inside excluded chrome.
    pub filtered_count: usize,
}

/// Extract outbound links from the main-content region of `html`.
///
/// Relative hrefs resolve against `page_url`. When `same_domain` is set,
/// links to other hostnames are dropped. Results are deduplicated after
/// stripping fragments and one trailing slash.
#[must_use]
pub fn extract_content_links(
    html: &str,
    page_url: &Url,
    same_domain: Option<&str>,
) -> ContentLinks {
    let document = Html::parse_document(html);

    let (container, root) = find_content_container(&document);
    let anchor_selector = Selector::parse("a[href]").expect("static selector");
    let exclusions: Vec<Selector> = EXCLUSION_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect();

    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut filtered_count = 0;

    for anchor in root.select(&anchor_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !is_followable(href) {
            continue;
        }

        if inside_excluded(anchor, &exclusions) {
            filtered_count += 1;
            continue;
        }

        let Ok(resolved) = page_url.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if let Some(host) = same_domain {
            if resolved.host_str() != Some(host) {
                continue;
            }
        }

        let normalized = normalize_link(&resolved);
        if seen.insert(normalized.clone()) {
            links.push(normalized);
        }
    }

    debug!(
        url = %page_url,
        container = container.unwrap_or("<document>"),
        links = links.len(),
        filtered = filtered_count,
        "Content links extracted"
    );

    ContentLinks {
        links,
        container,
        filtered_count,
    }
}

/// Strip the fragment and one trailing slash (except on the root path).
#[must_use]
pub fn normalize_link(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut out = normalized.to_string();
    if out.ends_with('/') && normalized.path() != "/" {
        out.pop();
    }
    out
}

fn find_content_container(document: &Html) -> (Option<&'static str>, ElementRef<'_>) {
    for selector_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            return (Some(selector_str), element);
        }
    }
    // No content container: fall back to the whole document, relying on the
    // exclusion selectors alone.
    (None, document.root_element())
}

fn inside_excluded(element: ElementRef<'_>, exclusions: &[Selector]) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| exclusions.iter().any(|sel| sel.matches(&ancestor)))
}

fn is_followable(href: &str) -> bool {
    let trimmed = href.trim();
    !(trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.starts_with("javascript:")
        || trimmed.starts_with("mailto:")
        || trimmed.starts_with("tel:")
        || trimmed.starts_with("data:"))
}
