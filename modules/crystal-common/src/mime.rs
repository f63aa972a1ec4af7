//! Content-type tables and sniffing.
//!
//! Revisions fetched over HTTP declare a content type in their headers.
//! When no declaration exists the type is guessed from the URL extension.

/// Split a `Content-Type` header value into its media type and charset
/// parameter, if any. RFC 2045 parameters other than `charset` are ignored.
pub fn parse_content_type(header: &str) -> (String, Option<String>) {
    let mut parts = header.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts.find_map(|p| {
        let p = p.trim();
        let (key, value) = p.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    });
    (media_type, charset)
}

/// Guess a media type from a URL's path extension, for revisions fetched
/// without HTTP metadata.
pub fn guess_content_type(url: &str) -> Option<&'static str> {
    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    let ext = path.rsplit_once('.').map(|(_, e)| e)?;
    let ct = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "text/xml",
        "rss" => "application/rss+xml",
        "atom" => "application/atom+xml",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "ico" => "image/vnd.microsoft.icon",
        "svg" => "image/svg+xml",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "jar" => "application/java-archive",
        _ => return None,
    };
    Some(ct)
}

pub fn is_html(content_type: &str) -> bool {
    content_type == "text/html"
}

pub fn is_css(content_type: &str) -> bool {
    content_type == "text/css"
}

pub fn is_json(content_type: &str) -> bool {
    content_type == "application/json"
}

pub fn is_xml(content_type: &str) -> bool {
    matches!(
        content_type,
        "text/xml" | "application/xml" | "application/rss+xml" | "application/atom+xml"
    )
}

/// Media types known to carry no parseable links. Revisions of these types
/// are archived but never handed to the link extractor.
pub fn is_recognized_binary_type(content_type: &str) -> bool {
    matches!(
        content_type,
        // application
        "application/gzip"
            | "application/java-archive"
            | "application/zip"
            | "application/vnd.rar"
            | "application/x-tar"
            | "application/x-7z-compressed"
            // audio
            | "audio/aac"
            | "audio/mp4"
            | "audio/mpeg"
            | "audio/ogg"
            | "audio/opus"
            | "audio/vorbis"
            | "audio/midi"
            | "audio/x-midi"
            | "audio/wav"
            | "audio/webm"
            // fonts
            | "font/otf"
            | "font/ttf"
            | "font/woff"
            | "font/woff2"
            | "application/vnd.ms-fontobject"
            // images (SVG excluded: it is XML and may carry links)
            | "image/apng"
            | "image/bmp"
            | "image/gif"
            | "image/jpeg"
            | "image/png"
            | "image/tiff"
            | "image/webp"
            | "image/vnd.microsoft.icon"
            // video
            | "video/mp4"
            | "video/ogg"
            | "video/quicktime"
            | "video/x-msvideo"
            | "video/mpeg"
            | "video/webm"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_header_splits_off_charset() {
        assert_eq!(
            parse_content_type("text/html; charset=UTF-8"),
            ("text/html".to_string(), Some("utf-8".to_string()))
        );
        assert_eq!(parse_content_type("text/css"), ("text/css".to_string(), None));
    }

    #[test]
    fn guesses_from_extension() {
        assert_eq!(guess_content_type("https://example.com/a.png"), Some("image/png"));
        assert_eq!(
            guess_content_type("https://example.com/page.html?x=1"),
            Some("text/html")
        );
        assert_eq!(guess_content_type("https://example.com/no-extension"), None);
    }

    #[test]
    fn binary_table_includes_images_but_not_svg() {
        assert!(is_recognized_binary_type("image/png"));
        assert!(is_recognized_binary_type("video/mp4"));
        assert!(!is_recognized_binary_type("image/svg+xml"));
        assert!(!is_recognized_binary_type("text/html"));
    }

    #[test]
    fn xml_covers_feed_types() {
        assert!(is_xml("application/rss+xml"));
        assert!(is_xml("application/atom+xml"));
        assert!(is_xml("text/xml"));
        assert!(!is_xml("text/html"));
    }
}
