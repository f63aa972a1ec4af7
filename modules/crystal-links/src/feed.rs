//! XML link extraction via feed parsing (RSS / Atom / RDF).
//!
//! Generic XML that is not a syndication feed yields no links.

use crate::Link;

pub(crate) fn extract(body: &[u8]) -> Vec<Link> {
    let Ok(feed) = feed_rs::parser::parse(body) else {
        return Vec::new();
    };

    let mut links = Vec::new();

    for link in &feed.links {
        links.push(Link::external(
            link.href.clone(),
            "Feed Link",
            feed.title.as_ref().map(|t| t.content.clone()),
        ));
    }

    for entry in &feed.entries {
        let title = entry.title.as_ref().map(|t| t.content.clone());
        for link in &entry.links {
            links.push(Link::external(link.href.clone(), "Feed Entry", title.clone()));
        }
        if let Some(content) = &entry.content {
            if let Some(src) = &content.src {
                links.push(Link::external(src.href.clone(), "Feed Content", title.clone()));
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &[u8] = br#"<?xml version="1.0"?>
        <rss version="2.0">
          <channel>
            <title>Example Feed</title>
            <link>https://example.com/</link>
            <item>
              <title>First post</title>
              <link>https://example.com/posts/1</link>
            </item>
            <item>
              <title>Second post</title>
              <link>https://example.com/posts/2</link>
            </item>
          </channel>
        </rss>"#;

    #[test]
    fn rss_entry_links_are_found() {
        let links = extract(RSS);
        let urls: Vec<_> = links.iter().map(|l| l.relative_url.as_str()).collect();
        assert!(urls.contains(&"https://example.com/posts/1"));
        assert!(urls.contains(&"https://example.com/posts/2"));
        assert!(links.iter().all(|l| !l.embedded));
    }

    #[test]
    fn entry_titles_are_carried() {
        let links = extract(RSS);
        let first = links
            .iter()
            .find(|l| l.relative_url == "https://example.com/posts/1")
            .unwrap();
        assert_eq!(first.title.as_deref(), Some("First post"));
    }

    #[test]
    fn atom_feeds_parse_too() {
        let atom = br#"<?xml version="1.0"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
              <title>Atom Feed</title>
              <entry>
                <title>Entry</title>
                <link href="https://example.com/atom/1"/>
              </entry>
            </feed>"#;
        let links = extract(atom);
        assert!(links
            .iter()
            .any(|l| l.relative_url == "https://example.com/atom/1"));
    }

    #[test]
    fn non_feed_xml_yields_nothing() {
        let xml = br#"<?xml version="1.0"?><config><option name="a">1</option></config>"#;
        assert!(extract(xml).is_empty());
    }
}
