//! JSON link extraction: any string value that parses as an HTTP(S) URL.

use serde_json::Value;
use url::Url;

use crate::Link;

pub(crate) fn extract(body: &[u8]) -> Vec<Link> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let mut links = Vec::new();
    walk(&value, &mut links);
    links
}

fn walk(value: &Value, out: &mut Vec<Link>) {
    match value {
        Value::String(s) => {
            if looks_like_url(s) {
                out.push(Link::external(s.clone(), "URL", None));
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        Value::Object(map) => {
            for (_, item) in map {
                walk(item, out);
            }
        }
        _ => {}
    }
}

fn looks_like_url(s: &str) -> bool {
    (s.starts_with("http://") || s.starts_with("https://")) && Url::parse(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_urls_are_found_at_any_depth() {
        let body = br#"{"a": "https://example.com/x", "b": {"c": ["https://example.com/y"]}}"#;
        let links = extract(body);
        let urls: Vec<_> = links.iter().map(|l| l.relative_url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/x", "https://example.com/y"]);
        assert!(links.iter().all(|l| !l.embedded));
    }

    #[test]
    fn non_url_strings_are_ignored() {
        let body = br#"{"name": "example", "count": 3, "flag": true}"#;
        assert!(extract(body).is_empty());
    }

    #[test]
    fn invalid_json_yields_nothing() {
        assert!(extract(b"{not json").is_empty());
    }
}
