//! URL normalization helpers shared by the store and the link extractor.

use url::Url;

/// Schemes whose links cannot be rewritten to point into an archive.
/// Links with these schemes are dropped by the extractor.
const UNREWRITABLE_SCHEMES: &[&str] = &[
    "mailto", "javascript", "data", "tel", "about", "blob", "cid",
];

/// Normalize an absolute URL: parse it and strip any fragment component.
///
/// Returns `None` if the input does not parse as an absolute URL.
///
/// ```
/// assert_eq!(
///     crystal_common::normalize_url("https://example.com/page#section"),
///     Some("https://example.com/page".to_string()),
/// );
/// assert_eq!(crystal_common::normalize_url("not a url"), None);
/// ```
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Resolve a possibly-relative URL against a base, returning an absolute
/// URL with the fragment stripped. Returns `None` if neither the raw value
/// nor the joined value parses.
pub fn join_url(base: &str, raw: &str) -> Option<String> {
    let mut parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => Url::parse(base).ok()?.join(raw).ok()?,
    };
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Whether a URL (or URL reference) uses a scheme that can never be
/// rewritten to point at archived content.
pub fn is_unrewritable_url(url: &str) -> bool {
    let Some(colon) = url.find(':') else {
        return false;
    };
    let scheme = &url[..colon];
    if !scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        || !scheme.starts_with(|c: char| c.is_ascii_alphabetic())
    {
        // Not a scheme at all (e.g. a path containing ':')
        return false;
    }
    UNREWRITABLE_SCHEMES
        .iter()
        .any(|s| scheme.eq_ignore_ascii_case(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- normalize_url ---

    #[test]
    fn fragment_is_stripped() {
        assert_eq!(
            normalize_url("https://example.com/a#frag"),
            Some("https://example.com/a".to_string())
        );
    }

    #[test]
    fn query_is_preserved() {
        assert_eq!(
            normalize_url("https://example.com/a?x=1#frag"),
            Some("https://example.com/a?x=1".to_string())
        );
    }

    #[test]
    fn relative_url_does_not_normalize() {
        assert_eq!(normalize_url("/relative/path"), None);
    }

    // --- join_url ---

    #[test]
    fn joins_relative_against_base() {
        assert_eq!(
            join_url("https://example.com/dir/page", "/a.png"),
            Some("https://example.com/a.png".to_string())
        );
    }

    #[test]
    fn absolute_href_ignores_base() {
        assert_eq!(
            join_url("https://example.com/", "https://other.com/x"),
            Some("https://other.com/x".to_string())
        );
    }

    #[test]
    fn joined_fragment_is_stripped() {
        assert_eq!(
            join_url("https://example.com/page", "other#top"),
            Some("https://example.com/other".to_string())
        );
    }

    // --- is_unrewritable_url ---

    #[test]
    fn mailto_and_javascript_are_unrewritable() {
        assert!(is_unrewritable_url("mailto:a@example.com"));
        assert!(is_unrewritable_url("javascript:void(0)"));
        assert!(is_unrewritable_url("data:image/png;base64,AAAA"));
    }

    #[test]
    fn http_and_relative_are_rewritable() {
        assert!(!is_unrewritable_url("https://example.com/"));
        assert!(!is_unrewritable_url("/relative/path"));
        assert!(!is_unrewritable_url("page.html"));
    }

    #[test]
    fn path_containing_colon_is_not_a_scheme() {
        assert!(!is_unrewritable_url("/wiki/File:Example.png"));
    }
}
