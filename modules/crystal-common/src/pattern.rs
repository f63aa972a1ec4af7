//! URL patterns for resource groups.
//!
//! A pattern is literal text plus wildcards:
//! `**` matches any run of characters, `*` matches a run that stays within
//! one path/query component, `#` matches one or more digits, `@` matches
//! one or more letters. Patterns are anchored at both ends.

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("cannot compile an empty URL pattern")]
    Empty,
    #[error("invalid URL pattern: {0}")]
    Invalid(#[from] regex::Error),
}

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pattern: String,
    regex: Regex,
    literal_prefix: String,
}

impl UrlPattern {
    pub fn compile(pattern: &str) -> Result<UrlPattern, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        // Escape regex characters, then substitute wildcard tokens.
        // The two-step replacement keeps `**` from being eaten by `*`.
        let mut patstr = regex::escape(pattern);
        patstr = patstr.replace(r"\*\*", "\u{0}STARSTAR\u{0}");
        patstr = patstr.replace(r"\*", "\u{0}STAR\u{0}");
        patstr = patstr.replace(r"\#", "\u{0}DIGITS\u{0}");
        patstr = patstr.replace('#', "\u{0}DIGITS\u{0}");
        patstr = patstr.replace('@', "\u{0}LETTERS\u{0}");

        patstr = patstr.replace("\u{0}STARSTAR\u{0}", "(.*)");
        patstr = patstr.replace("\u{0}STAR\u{0}", "([^/?=&]*)");
        patstr = patstr.replace("\u{0}DIGITS\u{0}", "([0-9]+)");
        patstr = patstr.replace("\u{0}LETTERS\u{0}", "([a-zA-Z]+)");

        let regex = Regex::new(&format!("^{patstr}$"))?;
        Ok(UrlPattern {
            pattern: pattern.to_string(),
            regex,
            literal_prefix: literal_prefix_of(pattern).to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// The longest prefix of the pattern that contains no wildcards.
    /// Useful for prefiltering membership scans.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }
}

fn literal_prefix_of(pattern: &str) -> &str {
    let first_meta = ["**", "*", "#", "@"]
        .iter()
        .filter_map(|m| pattern.find(m))
        .min();
    match first_meta {
        Some(i) => &pattern[..i],
        None => pattern,
    }
}
