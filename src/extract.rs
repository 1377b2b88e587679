//! HTML extraction: turn a fetched page into a markdown-ish text document
//! plus a title, and harvest same-origin links for the crawl frontier.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::models::Selectors;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page has no extractable content")]
    EmptyContent,
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub title: String,
    pub body: String,
    pub word_count: i64,
}

/// Elements whose subtrees never contribute to the document body.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "template",
];

/// File extensions we never treat as pages.
const BINARY_EXTENSIONS: &[&str] = &[
    ".pdf", ".zip", ".tar", ".gz", ".tgz", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico",
    ".webp", ".mp4", ".mp3", ".wav", ".woff", ".woff2", ".ttf", ".eot", ".exe", ".dmg", ".whl",
];

/// Extract title and body text from an HTML page.
///
/// The content root is the first match of the custom content selector if one
/// is configured, otherwise `main`, then `article`, then `body`. Removal
/// selectors and boilerplate tags are pruned before rendering.
pub fn extract(
    html: &str,
    url: &Url,
    selectors: Option<&Selectors>,
    min_words: usize,
) -> Result<ExtractedPage, ExtractError> {
    let doc = Html::parse_document(html);

    let mut removed: HashSet<ego_tree::NodeId> = HashSet::new();
    if let Some(sel) = selectors {
        for css in &sel.remove {
            if let Ok(parsed) = Selector::parse(css) {
                for el in doc.select(&parsed) {
                    removed.insert(el.id());
                }
            }
        }
    }

    let root = content_root(&doc, selectors);
    let mut body = String::new();
    if let Some(root) = root {
        render_blocks(root, &mut body, &removed);
    }
    let body = tidy(&body);

    let word_count = body.split_whitespace().count();
    if word_count < min_words {
        return Err(ExtractError::EmptyContent);
    }

    let title = extract_title(&doc, url, selectors);

    Ok(ExtractedPage {
        title,
        body,
        word_count: word_count as i64,
    })
}

fn content_root<'a>(doc: &'a Html, selectors: Option<&Selectors>) -> Option<ElementRef<'a>> {
    if let Some(css) = selectors.and_then(|s| s.content.as_deref()) {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(el) = doc.select(&sel).next() {
                return Some(el);
            }
        }
    }
    for css in ["main", "article", "div[role='main']", "body"] {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(el) = doc.select(&sel).next() {
                return Some(el);
            }
        }
    }
    doc.root_element().into()
}

fn extract_title(doc: &Html, url: &Url, selectors: Option<&Selectors>) -> String {
    if let Some(css) = selectors.and_then(|s| s.title.as_deref()) {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(el) = doc.select(&sel).next() {
                let text = collapse_ws(&el.text().collect::<String>());
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }
    for css in ["title", "h1"] {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(el) = doc.select(&sel).next() {
                let text = collapse_ws(&el.text().collect::<String>());
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }
    url.path_segments()
        .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Untitled".to_string())
}

fn render_blocks(el: ElementRef<'_>, out: &mut String, removed: &HashSet<ego_tree::NodeId>) {
    let name = el.value().name();
    if removed.contains(&el.id()) || SKIP_TAGS.contains(&name) {
        return;
    }
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name.as_bytes()[1] - b'0';
            let text = render_inline(el, removed);
            if !text.is_empty() {
                out.push_str("\n\n");
                for _ in 0..level {
                    out.push('#');
                }
                out.push(' ');
                out.push_str(&text);
                out.push('\n');
            }
        }
        "p" | "blockquote" | "td" | "th" | "dd" | "dt" => {
            let text = render_inline(el, removed);
            if !text.is_empty() {
                out.push('\n');
                out.push_str(&text);
                out.push('\n');
            }
        }
        "li" => {
            let text = render_inline(el, removed);
            if !text.is_empty() {
                out.push_str("\n- ");
                out.push_str(&text);
            }
            // Nested lists still need block handling.
            for child in el.children() {
                if let Some(child_el) = ElementRef::wrap(child) {
                    if matches!(child_el.value().name(), "ul" | "ol") {
                        render_blocks(child_el, out, removed);
                    }
                }
            }
        }
        "pre" => {
            let code: String = el.text().collect();
            let code = code.trim_matches('\n');
            if !code.is_empty() {
                out.push_str("\n```\n");
                out.push_str(code);
                out.push_str("\n```\n");
            }
        }
        _ => {
            for child in el.children() {
                if let Some(child_el) = ElementRef::wrap(child) {
                    render_blocks(child_el, out, removed);
                } else if let Some(text) = child.value().as_text() {
                    // Bare text nodes inside containers (rare but legal).
                    let t = collapse_ws(text);
                    if !t.is_empty() {
                        out.push('\n');
                        out.push_str(&t);
                        out.push('\n');
                    }
                }
            }
        }
    }
}

fn render_inline(el: ElementRef<'_>, removed: &HashSet<ego_tree::NodeId>) -> String {
    let mut out = String::new();
    inline_children(el, &mut out, removed);
    collapse_ws(&out)
}

fn inline_children(el: ElementRef<'_>, out: &mut String, removed: &HashSet<ego_tree::NodeId>) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        if removed.contains(&child_el.id()) || SKIP_TAGS.contains(&name) {
            continue;
        }
        match name {
            "code" => {
                let code: String = child_el.text().collect();
                out.push('`');
                out.push_str(code.trim());
                out.push('`');
            }
            "a" => {
                let mut text = String::new();
                inline_children(child_el, &mut text, removed);
                let text = collapse_ws(&text);
                match child_el.value().attr("href") {
                    Some(href) if !text.is_empty() => {
                        out.push('[');
                        out.push_str(&text);
                        out.push_str("](");
                        out.push_str(href);
                        out.push(')');
                    }
                    _ => out.push_str(&text),
                }
            }
            "strong" | "b" => {
                let mut text = String::new();
                inline_children(child_el, &mut text, removed);
                let text = collapse_ws(&text);
                if !text.is_empty() {
                    out.push_str("**");
                    out.push_str(&text);
                    out.push_str("**");
                }
            }
            "em" | "i" => {
                let mut text = String::new();
                inline_children(child_el, &mut text, removed);
                let text = collapse_ws(&text);
                if !text.is_empty() {
                    out.push('*');
                    out.push_str(&text);
                    out.push('*');
                }
            }
            "br" => out.push(' '),
            _ => inline_children(child_el, out, removed),
        }
    }
}

/// Harvest same-origin links from a page, resolved against `base`, with
/// fragments stripped and obvious non-pages skipped. Order preserved,
/// duplicates removed.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for el in doc.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
        {
            continue;
        }
        let Ok(mut url) = base.join(href) else {
            continue;
        };
        url.set_fragment(None);
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        if url.host_str() != base.host_str() || url.port_or_known_default() != base.port_or_known_default()
        {
            continue;
        }
        let path_lower = url.path().to_ascii_lowercase();
        if BINARY_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            continue;
        }
        if seen.insert(url.to_string()) {
            links.push(url);
        }
    }
    links
}

/// Derive a stable document path from a URL. Path and query are lowercased
/// and squashed to `[a-z0-9-]`; the root becomes "index". Slugs longer than
/// 80 characters are truncated to 70 and suffixed with an 8-hex-digit hash
/// of the full URL to keep them unique.
pub fn url_to_slug(url: &Url) -> String {
    let mut raw = url.path().to_string();
    if let Some(q) = url.query() {
        raw.push('-');
        raw.push_str(q);
    }

    let mut slug = String::new();
    let mut prev_dash = true;
    for ch in raw.to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        return "index".to_string();
    }
    if slug.len() > 80 {
        let digest = Sha256::digest(url.as_str().as_bytes());
        let hex: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}", &slug[..70], hex)
    } else {
        slug
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tidy(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0;
    for line in s.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
