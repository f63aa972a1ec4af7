//! HTML link extraction.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::Link;

pub const FAVICON_TYPE_TITLE: &str = "Favicon";

static ANY_ELEMENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("*").expect("valid selector"));

/// Extract links from an HTML document, in document order.
///
/// Anchors are non-embedded; images, stylesheets, scripts, frames, and
/// form-image inputs are embedded. If the document lives at the site root
/// and declares no favicon, an implicit embedded `/favicon.ico` link is
/// appended.
pub(crate) fn extract(body: &[u8], _declared_charset: Option<&str>, url: &str) -> Vec<Link> {
    let text = String::from_utf8_lossy(body);
    let doc = Html::parse_document(&text);

    let mut links = Vec::new();
    let mut saw_favicon = false;

    for el in doc.select(&ANY_ELEMENT) {
        let v = el.value();
        match v.name() {
            "a" | "area" => {
                if let Some(href) = v.attr("href") {
                    links.push(Link::external(href, "Link", element_title(&el)));
                }
            }
            "img" => {
                if let Some(src) = v.attr("src") {
                    let mut link = Link::embedded(src, "Image");
                    link.title = v.attr("alt").map(str::to_string).filter(|t| !t.is_empty());
                    links.push(link);
                }
            }
            "script" => {
                if let Some(src) = v.attr("src") {
                    links.push(Link::embedded(src, "Script"));
                }
            }
            "link" => {
                if let Some(href) = v.attr("href") {
                    let rel = v.attr("rel").unwrap_or("");
                    if rel_contains(rel, "stylesheet") {
                        links.push(Link::embedded(href, "Stylesheet"));
                    } else if rel_contains(rel, "icon") || rel_contains(rel, "apple-touch-icon") {
                        saw_favicon = true;
                        links.push(Link::embedded(href, FAVICON_TYPE_TITLE));
                    } else {
                        links.push(Link::external(href, "Link", None));
                    }
                }
            }
            "iframe" | "frame" => {
                if let Some(src) = v.attr("src") {
                    links.push(Link::embedded(src, "Frame"));
                }
            }
            "input" => {
                let is_image_input = v
                    .attr("type")
                    .is_some_and(|t| t.eq_ignore_ascii_case("image"));
                if is_image_input {
                    if let Some(src) = v.attr("src") {
                        links.push(Link::embedded(src, "Form Image"));
                    }
                }
            }
            "body" => {
                if let Some(background) = v.attr("background") {
                    links.push(Link::embedded(background, "Background Image"));
                }
            }
            _ => {}
        }
    }

    if !saw_favicon && url_path_is_root(url) {
        links.push(Link::embedded("/favicon.ico", FAVICON_TYPE_TITLE));
    }

    links
}

fn element_title(el: &ElementRef) -> Option<String> {
    let text = el.text().collect::<String>();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn rel_contains(rel: &str, token: &str) -> bool {
    rel.split_ascii_whitespace()
        .any(|t| t.eq_ignore_ascii_case(token))
}

fn url_path_is_root(url: &str) -> bool {
    Url::parse(url).map(|u| u.path() == "/").unwrap_or(false)
}
