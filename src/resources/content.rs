//! Inline image handling for blog bodies.
//!
//! Blog HTML references stored images with `<img data-path="{key}">`.  The
//! stored body never carries URLs; on read every tagged image gets a fresh
//! signed `src`, replacing whatever `src` the body held.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn img_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid img pattern"))
}

fn data_path_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\sdata-path\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("valid data-path pattern")
    })
}

fn src_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\ssrc\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid src pattern")
    })
}

fn data_path(tag: &str) -> Option<&str> {
    let caps = data_path_attr().captures(tag)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim())
        .filter(|p| !p.is_empty())
}

/// Keys of every tagged inline image, in document order, without repeats.
pub fn inline_paths(html: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for tag in img_tag().find_iter(html) {
        if let Some(path) = data_path(tag.as_str()) {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Point every tagged image at its URL from `urls`, or at `fallback` when
/// the key has none.  Untagged images are left alone.
pub fn rewrite_sources(html: &str, urls: &HashMap<String, String>, fallback: &str) -> String {
    img_tag()
        .replace_all(html, |caps: &Captures| {
            let tag = &caps[0];
            let Some(path) = data_path(tag) else {
                return tag.to_string();
            };
            let url = escape_attr(urls.get(path).map(String::as_str).unwrap_or(fallback));
            let attr = format!(" src=\"{url}\"");

            if src_attr().is_match(tag) {
                return src_attr().replace(tag, regex::NoExpand(&attr)).into_owned();
            }
            let (body, close) = match tag.strip_suffix("/>") {
                Some(body) => (body, "/>"),
                None => (&tag[..tag.len() - 1], ">"),
            };
            format!("{}{}{}", body.trim_end(), attr, close)
        })
        .into_owned()
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
