//! Resource enumeration for a rendered page.
//!
//! Works over the HTML the browser hands back after rendering, so
//! JavaScript-inserted images and stylesheets are visible. Fonts require a
//! second pass: stylesheet text is fetched and `@font-face` blocks parsed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::downloader::ResourceDownloader;

pub(crate) static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("static regex")
});

static FONT_FACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@font-face\s*\{[^}]*\}").expect("static regex"));

static FONT_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"src\s*:\s*([^;}]+)").expect("static regex"));

static WIKI_THUMB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.*wikipedia\S*?)/thumb/(?P<d1>[^/]+)/(?P<d2>[^/]+)/(?P<file>[^/]+)/\d+px-[^/]+$")
        .expect("static regex")
});

/// An inline `<style>` block: content plus its position among style blocks.
#[derive(Debug, Clone)]
pub struct InlineStylesheet {
    pub index: usize,
    pub content: String,
}

/// Everything a page references, as absolute URLs.
#[derive(Debug, Clone, Default)]
pub struct ExtractedResources {
    /// `<img>` elements seen, independent of how many files their
    /// srcsets contribute.
    pub image_elements: usize,
    pub images: Vec<String>,
    pub stylesheets: Vec<String>,
    pub inline_styles: Vec<InlineStylesheet>,
    pub scripts: Vec<String>,
    pub fonts: Vec<String>,
    pub favicon: Option<String>,
    /// Wikipedia thumbnail URL → original-file URL. Consulted by the
    /// rewriter when resolving `/wiki/File:` anchors; does not itself
    /// rewrite anything.
    pub thumbnail_originals: HashMap<String, String>,
}

impl ExtractedResources {
    /// Total number of downloadable resources (fonts included).
    #[must_use]
    pub fn count(&self) -> usize {
        self.images.len()
            + self.stylesheets.len()
            + self.scripts.len()
            + self.fonts.len()
            + usize::from(self.favicon.is_some())
    }
}

/// Enumerate the resources of a rendered page. Pure: no network.
///
/// `base_url` must already account for any `<base href>` in the document
/// (see [`super::rewriter::effective_base_url`]).
#[must_use]
pub fn extract_page_resources(html: &str, base_url: &Url) -> ExtractedResources {
    let document = Html::parse_document(html);
    let mut resources = ExtractedResources::default();
    let mut seen_images = std::collections::HashSet::new();

    let mut push_image = |resources: &mut ExtractedResources, raw: &str| {
        let Some(url) = resolve_url(base_url, raw) else {
            return;
        };
        if let Some(original) = wikipedia_thumb_original(&url) {
            resources
                .thumbnail_originals
                .insert(url.clone(), original);
        }
        if seen_images.insert(url.clone()) {
            resources.images.push(url);
        }
    };

    // <img src> and srcset candidates
    let img_selector = Selector::parse("img").expect("static selector");
    for img in document.select(&img_selector) {
        if let Some(src) = img.value().attr("src") {
            resources.image_elements += 1;
            push_image(&mut resources, src);
        }
        if let Some(srcset) = img.value().attr("srcset") {
            for candidate in srcset_urls(srcset) {
                push_image(&mut resources, &candidate);
            }
        }
    }

    // <picture><source srcset>
    let source_selector = Selector::parse("picture > source[srcset]").expect("static selector");
    for source in document.select(&source_selector) {
        if let Some(srcset) = source.value().attr("srcset") {
            for candidate in srcset_urls(srcset) {
                push_image(&mut resources, &candidate);
            }
        }
    }

    // Inline style="...background...url(...)..."
    let styled_selector = Selector::parse("[style]").expect("static selector");
    for element in document.select(&styled_selector) {
        let Some(style) = element.value().attr("style") else {
            continue;
        };
        if !style.contains("background") {
            continue;
        }
        for capture in CSS_URL_RE.captures_iter(style) {
            push_image(&mut resources, &capture[1]);
        }
    }

    // External stylesheets
    let link_selector = Selector::parse("link[rel=\"stylesheet\"]").expect("static selector");
    for link in document.select(&link_selector) {
        if let Some(href) = link.value().attr("href") {
            if let Some(url) = resolve_url(base_url, href) {
                if !resources.stylesheets.contains(&url) {
                    resources.stylesheets.push(url);
                }
            }
        }
    }

    // Inline <style> blocks, positional
    let style_selector = Selector::parse("style").expect("static selector");
    for (index, style) in document.select(&style_selector).enumerate() {
        let content: String = style.text().collect();
        if !content.trim().is_empty() {
            resources.inline_styles.push(InlineStylesheet { index, content });
        }
    }

    // Scripts
    let script_selector = Selector::parse("script[src]").expect("static selector");
    for script in document.select(&script_selector) {
        if let Some(src) = script.value().attr("src") {
            if let Some(url) = resolve_url(base_url, src) {
                if !resources.scripts.contains(&url) {
                    resources.scripts.push(url);
                }
            }
        }
    }

    // Favicon
    let icon_selector = Selector::parse("link[rel*=\"icon\"]").expect("static selector");
    if let Some(icon) = document.select(&icon_selector).next() {
        if let Some(href) = icon.value().attr("href") {
            resources.favicon = resolve_url(base_url, href);
        }
    }

    resources
}

/// Fetch each stylesheet's text and harvest `@font-face` URLs, resolved
/// against the owning stylesheet (inline blocks resolve against the page).
///
/// Unreachable stylesheets are skipped; font extraction is best-effort.
pub async fn extract_font_urls(
    downloader: &ResourceDownloader,
    resources: &ExtractedResources,
    page_url: &Url,
) -> Vec<String> {
    let mut fonts = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for sheet_url in &resources.stylesheets {
        let css = match downloader.fetch_text(sheet_url).await {
            Ok(text) => text,
            Err(e) => {
                debug!(url = %sheet_url, error = %e, "Stylesheet fetch for font extraction failed");
                continue;
            }
        };
        let Ok(base) = Url::parse(sheet_url) else {
            continue;
        };
        for font in font_face_urls(&css, &base) {
            if seen.insert(font.clone()) {
                fonts.push(font);
            }
        }
    }

    for inline in &resources.inline_styles {
        for font in font_face_urls(&inline.content, page_url) {
            if seen.insert(font.clone()) {
                fonts.push(font);
            }
        }
    }

    fonts
}

/// Parse `@font-face { ... src: ... }` blocks, returning absolute font URLs.
#[must_use]
pub fn font_face_urls(css: &str, base: &Url) -> Vec<String> {
    let mut urls = Vec::new();
    for block in FONT_FACE_RE.find_iter(css) {
        for src in FONT_SRC_RE.captures_iter(block.as_str()) {
            for capture in CSS_URL_RE.captures_iter(&src[1]) {
                let raw = &capture[1];
                if raw.starts_with("data:") {
                    continue;
                }
                if let Ok(resolved) = base.join(raw) {
                    urls.push(resolved.to_string());
                }
            }
        }
    }
    urls
}

/// Candidate URLs of a `srcset` value (descriptors stripped).
#[must_use]
pub fn srcset_urls(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            candidate
                .split_whitespace()
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// Map a Wikipedia thumbnail URL to its original-file URL.
#[must_use]
pub fn wikipedia_thumb_original(url: &str) -> Option<String> {
    let captures = WIKI_THUMB_RE.captures(url)?;
    Some(format!(
        "{}/{}/{}/{}",
        &captures["base"], &captures["d1"], &captures["d2"], &captures["file"]
    ))
}

pub(crate) fn resolve_url(base: &Url, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("data:") {
        return None;
    }
    let resolved = if let Some(rest) = trimmed.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        base.join(trimmed).ok()?
    };
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.test/article").unwrap()
    }

    #[test]
    fn test_extracts_images_and_srcset() {
        let html = r#"
            <img src="/a.png">
            <img src="https://cdn.test/b.jpg"
                 srcset="https://cdn.test/b.jpg 1x, https://cdn.test/b@2x.jpg 2x">
        "#;
        let resources = extract_page_resources(html, &base());
        assert_eq!(
            resources.images,
            vec![
                "https://example.test/a.png",
                "https://cdn.test/b.jpg",
                "https://cdn.test/b@2x.jpg",
            ]
        );
        assert_eq!(resources.image_elements, 2);
    }

    #[test]
    fn test_extracts_picture_sources() {
        let html = r#"
            <picture>
                <source srcset="/hero.webp 1x, /hero@2x.webp 2x">
                <img src="/hero.jpg">
            </picture>
        "#;
        let resources = extract_page_resources(html, &base());
        assert!(resources
            .images
            .contains(&"https://example.test/hero.webp".to_string()));
        assert!(resources
            .images
            .contains(&"https://example.test/hero@2x.webp".to_string()));
    }

    #[test]
    fn test_extracts_background_style_urls_skipping_data() {
        let html = r#"
            <div style="background-image: url('/bg.png')"></div>
            <div style="background: url(data:image/png;base64,AAAA)"></div>
            <div style="color: red"></div>
        "#;
        let resources = extract_page_resources(html, &base());
        assert_eq!(resources.images, vec!["https://example.test/bg.png"]);
    }

    #[test]
    fn test_extracts_stylesheets_scripts_favicon() {
        let html = r#"
            <link rel="stylesheet" href="/s.css">
            <link rel="icon" href="/favicon.ico">
            <style>body { margin: 0 }</style>
            <script src="/app.js"></script>
            <script>inline();</script>
        "#;
        let resources = extract_page_resources(html, &base());
        assert_eq!(resources.stylesheets, vec!["https://example.test/s.css"]);
        assert_eq!(resources.scripts, vec!["https://example.test/app.js"]);
        assert_eq!(
            resources.favicon.as_deref(),
            Some("https://example.test/favicon.ico")
        );
        assert_eq!(resources.inline_styles.len(), 1);
        assert_eq!(resources.inline_styles[0].index, 0);
    }

    #[test]
    fn test_font_face_urls_resolved_against_sheet() {
        let css = r#"
            body { color: #333 }
            @font-face {
                font-family: "Archive Sans";
                src: url("/fonts/f.woff2") format("woff2"),
                     url(fallback.woff) format("woff");
            }
            @font-face { src: url(data:font/woff2;base64,AAAA); }
        "#;
        let sheet = Url::parse("https://example.test/css/s.css").unwrap();
        let urls = font_face_urls(css, &sheet);
        assert_eq!(
            urls,
            vec![
                "https://example.test/fonts/f.woff2",
                "https://example.test/css/fallback.woff",
            ]
        );
    }

    #[test]
    fn test_srcset_parsing_preserves_order() {
        let urls = srcset_urls("https://cdn.test/b.jpg 1x, https://cdn.test/b@2x.jpg 2x");
        assert_eq!(
            urls,
            vec!["https://cdn.test/b.jpg", "https://cdn.test/b@2x.jpg"]
        );
    }

    #[test]
    fn test_wikipedia_thumb_mapping() {
        let thumb =
            "https://upload.wikimedia.org/wikipedia/commons/thumb/a/a9/Example.jpg/250px-Example.jpg";
        assert_eq!(
            wikipedia_thumb_original(thumb).as_deref(),
            Some("https://upload.wikimedia.org/wikipedia/commons/a/a9/Example.jpg")
        );
        assert_eq!(
            wikipedia_thumb_original("https://example.test/thumb/a/b/c.jpg/250px-c.jpg"),
            None
        );
    }

    #[test]
    fn test_scheme_relative_promoted() {
        let html = r#"<img src="//cdn.test/x.png">"#;
        let resources = extract_page_resources(html, &base());
        assert_eq!(resources.images, vec!["https://cdn.test/x.png"]);
    }
}
