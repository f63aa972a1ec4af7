//! crystal-links — extracts outbound links from archived document bodies.
//!
//! Given body bytes and a content type, produces an ordered list of [`Link`]s.
//! HTML, CSS, JSON, and XML feed bodies are understood; everything else
//! yields no links. Links whose scheme can never be rewritten into an
//! archive (`mailto:`, `javascript:`, `data:`, ...) are dropped.

mod css;
mod feed;
mod html;
mod json;

use crystal_common::mime;

pub use html::FAVICON_TYPE_TITLE;

/// One outbound link discovered in a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// URL or URL reference, often relative to the containing document.
    pub relative_url: String,
    /// Displayed title for this link's kind ("Image", "Stylesheet", ...).
    pub type_title: &'static str,
    /// Displayed title for this specific link, if the document provides one.
    pub title: Option<String>,
    /// Whether the target is fetched automatically when the containing
    /// document is viewed (images, stylesheets, scripts, frames).
    pub embedded: bool,
    /// Whether a serving layer may rewrite this link to its own origin.
    pub rewritable: bool,
}

impl Link {
    pub(crate) fn embedded(relative_url: impl Into<String>, type_title: &'static str) -> Link {
        Link {
            relative_url: relative_url.into(),
            type_title,
            title: None,
            embedded: true,
            rewritable: true,
        }
    }

    pub(crate) fn external(
        relative_url: impl Into<String>,
        type_title: &'static str,
        title: Option<String>,
    ) -> Link {
        Link {
            relative_url: relative_url.into(),
            type_title,
            title,
            embedded: false,
            rewritable: true,
        }
    }
}

/// Extract links from a document body.
///
/// * `body` -- raw body bytes.
/// * `declared_charset` -- charset from the Content-Type header, if any.
/// * `content_type` -- declared or sniffed media type, if known.
/// * `url` -- the document's own URL (used for the implicit favicon link).
///
/// The returned list preserves document order. Unrewritable links are
/// filtered out.
pub fn extract_links(
    body: &[u8],
    declared_charset: Option<&str>,
    content_type: Option<&str>,
    url: &str,
) -> Vec<Link> {
    let links = match content_type {
        Some(ct) if mime::is_html(ct) => html::extract(body, declared_charset, url),
        Some(ct) if mime::is_css(ct) => css::extract(body),
        Some(ct) if mime::is_json(ct) => json::extract(body),
        Some(ct) if mime::is_xml(ct) => feed::extract(body),
        _ => Vec::new(),
    };
    links
        .into_iter()
        .filter(|link| !crystal_common::is_unrewritable_url(&link.relative_url))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_content_type_yields_no_links() {
        let links = extract_links(b"whatever", None, Some("application/pdf"), "https://e.com/");
        assert!(links.is_empty());
    }

    #[test]
    fn missing_content_type_yields_no_links() {
        let links = extract_links(b"<a href='/x'>x</a>", None, None, "https://e.com/");
        assert!(links.is_empty());
    }

    #[test]
    fn unrewritable_links_are_dropped() {
        let body = br#"<a href="mailto:a@e.com">mail</a><a href="/ok">ok</a>"#;
        let links = extract_links(body, None, Some("text/html"), "https://e.com/page");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].relative_url, "/ok");
    }
}
