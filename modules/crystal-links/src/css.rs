//! CSS link extraction: `url(...)` references and `@import` rules.

use std::sync::LazyLock;

use regex::Regex;

use crate::Link;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*['"]?([^'"()\s]+)['"]?\s*\)"#).expect("valid regex"));

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("valid regex"));

/// Every `url(...)` and string-form `@import` in document order.
/// (`@import url(...)` is already covered by the `url(...)` form.)
pub(crate) fn extract(body: &[u8]) -> Vec<Link> {
    let text = String::from_utf8_lossy(body);

    let mut found: Vec<(usize, Link)> = Vec::new();
    for cap in URL_RE.captures_iter(&text) {
        let m = cap.get(1).expect("group 1 exists");
        found.push((m.start(), Link::embedded(m.as_str(), "URL Reference")));
    }
    for cap in IMPORT_RE.captures_iter(&text) {
        let m = cap.get(1).expect("group 1 exists");
        found.push((m.start(), Link::embedded(m.as_str(), "@import")));
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, link)| link).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_references_are_embedded() {
        let links = extract(b"body { background: url(/bg.png); }");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].relative_url, "/bg.png");
        assert!(links[0].embedded);
    }

    #[test]
    fn quoted_url_references() {
        let links = extract(br#".a { background: url("bg.png"); } .b { cursor: url('c.cur'); }"#);
        let urls: Vec<_> = links.iter().map(|l| l.relative_url.as_str()).collect();
        assert_eq!(urls, vec!["bg.png", "c.cur"]);
    }

    #[test]
    fn string_imports_are_found() {
        let links = extract(br#"@import "base.css"; @import url(extra.css);"#);
        let urls: Vec<_> = links.iter().map(|l| l.relative_url.as_str()).collect();
        assert_eq!(urls, vec!["base.css", "extra.css"]);
    }

    #[test]
    fn order_follows_the_stylesheet() {
        let links = extract(br#"@import "first.css"; body { background: url(second.png); }"#);
        let urls: Vec<_> = links.iter().map(|l| l.relative_url.as_str()).collect();
        assert_eq!(urls, vec!["first.css", "second.png"]);
    }

    #[test]
    fn plain_css_yields_nothing() {
        assert!(extract(b"body { color: red; }").is_empty());
    }
}
