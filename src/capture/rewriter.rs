//! Rewrites captured HTML and CSS to reference local archive copies.
//!
//! The HTML pass runs once per page after every resource download has
//! settled, so the URL map is complete. Elements whose URLs cannot be
//! parsed or are not in the map are left untouched; a broken reference is
//! better than a mangled document.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::extractor::{resolve_url, CSS_URL_RE};

/// Absolute resource URL → relative archive path (`images/a.png`, …).
/// One map per capture; built only from successful downloads.
pub type UrlMap = HashMap<String, String>;

static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("static regex"));
static SOURCE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<source\b[^>]*>").expect("static regex"));
static LINK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("static regex"));
static SCRIPT_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>").expect("static regex"));
static A_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b[^>]*>").expect("static regex"));
static BASE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<base\b[^>]*>").expect("static regex"));
static CSP_META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\b[^>]*http-equiv\s*=\s*["']?content-security-policy["']?[^>]*>"#)
        .expect("static regex")
});
static SRI_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s(?:integrity|crossorigin)(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+))?"#)
        .expect("static regex")
});
static SRC_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| attr_pattern("src"));
static SRCSET_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| attr_pattern("srcset"));
static HREF_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| attr_pattern("href"));
static PX_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)px-").expect("static regex"));

const IMAGE_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".avif", ".ico",
];

const LOCAL_BUCKETS: &[&str] = &["images/", "css/", "js/", "fonts/"];

/// Resolve the document's effective base URL: the page URL, overridden by a
/// `<base href>` when present.
#[must_use]
pub fn effective_base_url(html: &str, page_url: &Url) -> Url {
    let document = Html::parse_document(html);
    let base_selector = Selector::parse("base[href]").expect("static selector");
    if let Some(base) = document.select(&base_selector).next() {
        if let Some(href) = base.value().attr("href") {
            if let Ok(resolved) = page_url.join(href) {
                return resolved;
            }
        }
    }
    page_url.clone()
}

/// Rewrite a page's HTML against the URL map.
///
/// Passes run in a fixed order: `<base>` removal, image `src`/`srcset`,
/// `<picture>` sources, stylesheet and favicon `href`s, script `src`s,
/// SRI/crossorigin stripping, CSP meta removal, then anchors (local image
/// targets, Wikipedia `File:` pages, absolutization of everything else
/// still relative).
#[must_use]
pub fn rewrite_html(html: &str, page_url: &Url, url_map: &UrlMap) -> String {
    let base = effective_base_url(html, page_url);

    // 1. The archive is self-referential; a surviving <base> would re-root
    //    every relative path we emit.
    let html = BASE_TAG_RE.replace_all(html, "").into_owned();

    // 2. Images
    let html = rewrite_tag_attr(&html, &IMG_TAG_RE, &SRC_ATTR_RE, |value| {
        mapped_path(&base, value, url_map)
    });
    let html = rewrite_tag_attr(&html, &IMG_TAG_RE, &SRCSET_ATTR_RE, |value| {
        rewrite_srcset(value, &base, url_map)
    });

    // 3. <picture> sources
    let html = rewrite_tag_attr(&html, &SOURCE_TAG_RE, &SRCSET_ATTR_RE, |value| {
        rewrite_srcset(value, &base, url_map)
    });

    // 4. Stylesheets and favicon
    let html = rewrite_tag_attr(&html, &LINK_TAG_RE, &HREF_ATTR_RE, |value| {
        mapped_path(&base, value, url_map)
    });

    // 5. Scripts
    let html = rewrite_tag_attr(&html, &SCRIPT_TAG_RE, &SRC_ATTR_RE, |value| {
        mapped_path(&base, value, url_map)
    });

    // 6. Local bytes no longer match remote hashes
    let html = strip_sri_attrs(&html, &SCRIPT_TAG_RE);
    let html = strip_sri_attrs(&html, &LINK_TAG_RE);

    // 7. A CSP written for the origin would block the local copies
    let html = CSP_META_RE.replace_all(&html, "").into_owned();

    // 8. Anchors
    rewrite_tag_attr(&html, &A_TAG_RE, &HREF_ATTR_RE, |value| {
        rewrite_anchor(value, &base, url_map)
    })
}

/// Rewrite `url(...)` references in a downloaded stylesheet.
///
/// Stylesheets live under `css/`, so mapped targets are reached through
/// `../<bucket>/<filename>`. `data:` URLs are untouched.
#[must_use]
pub fn rewrite_css(css: &str, sheet_url: &Url, url_map: &UrlMap) -> String {
    CSS_URL_RE
        .replace_all(css, |caps: &Captures| {
            let raw = &caps[1];
            if raw.starts_with("data:") {
                return caps[0].to_string();
            }
            let Some(absolute) = resolve_url(sheet_url, raw) else {
                return caps[0].to_string();
            };
            match url_map.get(&absolute) {
                Some(path) => format!("url(\"../{path}\")"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Build the attribute pattern `(\s<attr>\s*=\s*)("..."|'...')`.
///
/// The mandatory leading whitespace keeps `src` from matching `data-src`.
fn attr_pattern(attr: &str) -> Regex {
    Regex::new(&format!(r#"(?i)(\s{attr}\s*=\s*)("[^"]*"|'[^']*')"#)).expect("static regex")
}

/// For every tag matched by `tag_re`, rewrite the attribute matched by
/// `attr_re` through `map_value`. `None` leaves the attribute untouched.
fn rewrite_tag_attr<F>(html: &str, tag_re: &Regex, attr_re: &Regex, mut map_value: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    tag_re
        .replace_all(html, |tag: &Captures| {
            attr_re
                .replace_all(&tag[0], |attr: &Captures| {
                    let quoted = attr.get(2).map_or("", |m| m.as_str());
                    if quoted.len() < 2 {
                        return attr[0].to_string();
                    }
                    let quote = &quoted[..1];
                    let value = &quoted[1..quoted.len() - 1];
                    match map_value(value) {
                        Some(new_value) => format!("{}{quote}{new_value}{quote}", &attr[1]),
                        None => attr[0].to_string(),
                    }
                })
                .into_owned()
        })
        .into_owned()
}

fn strip_sri_attrs(html: &str, tag_re: &Regex) -> String {
    tag_re
        .replace_all(html, |tag: &Captures| {
            SRI_ATTR_RE.replace_all(&tag[0], "").into_owned()
        })
        .into_owned()
}

/// Map an attribute value to its archive path, if downloaded.
fn mapped_path(base: &Url, value: &str, url_map: &UrlMap) -> Option<String> {
    let absolute = resolve_url(base, value)?;
    url_map.get(&absolute).cloned()
}

/// Rewrite each srcset candidate that is in the map, preserving width and
/// density descriptors. Returns `None` when nothing changed.
fn rewrite_srcset(srcset: &str, base: &Url, url_map: &UrlMap) -> Option<String> {
    let mut changed = false;
    let rewritten: Vec<String> = srcset
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim();
            let mut parts = trimmed.split_whitespace();
            let Some(url_part) = parts.next() else {
                return trimmed.to_string();
            };
            let descriptors: Vec<&str> = parts.collect();
            let mapped = resolve_url(base, url_part).and_then(|abs| url_map.get(&abs).cloned());
            match mapped {
                Some(path) => {
                    changed = true;
                    if descriptors.is_empty() {
                        path
                    } else {
                        format!("{path} {}", descriptors.join(" "))
                    }
                }
                None => trimmed.to_string(),
            }
        })
        .collect();

    changed.then(|| rewritten.join(", "))
}

/// Anchor policy: local image targets are relinked into the archive,
/// Wikipedia `File:` pages resolve to the largest downloaded rendition,
/// and any other still-relative link is absolutized so it points back at
/// the live site.
fn rewrite_anchor(value: &str, base: &Url, url_map: &UrlMap) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.starts_with("javascript:")
        || trimmed.starts_with("mailto:")
        || trimmed.starts_with("tel:")
        || trimmed.starts_with("data:")
    {
        return None;
    }
    if LOCAL_BUCKETS.iter().any(|b| trimmed.starts_with(b)) {
        return None;
    }

    let absolute = resolve_url(base, trimmed)?;

    if let Some(path) = url_map.get(&absolute) {
        if has_image_extension(path) {
            return Some(path.clone());
        }
    }

    if let Some(resolved) = rewrite_wiki_file_anchor(&absolute, url_map) {
        return Some(resolved);
    }

    let already_absolute =
        trimmed.starts_with("http://") || trimmed.starts_with("https://");
    if already_absolute {
        return None;
    }

    debug!(href = %trimmed, absolutized = %absolute, "Anchor absolutized");
    Some(absolute)
}

/// Resolve a `/wiki/File:<name>` anchor to the largest downloaded rendition
/// of that file.
fn rewrite_wiki_file_anchor(absolute: &str, url_map: &UrlMap) -> Option<String> {
    let url = Url::parse(absolute).ok()?;
    let name = url.path().strip_prefix("/wiki/File:")?;
    let decoded = urlencoding::decode(name).ok()?;

    url_map
        .iter()
        .filter(|(key, path)| key.contains(decoded.as_ref()) && has_image_extension(path))
        .max_by_key(|(key, _)| px_prefix(key))
        .map(|(_, path)| path.clone())
}

fn px_prefix(url: &str) -> u64 {
    PX_PREFIX_RE
        .captures(url)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

fn has_image_extension(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
