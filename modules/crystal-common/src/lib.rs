pub mod http_date;
pub mod mime;
pub mod pattern;
pub mod urls;

pub use pattern::{PatternError, UrlPattern};
pub use urls::{is_unrewritable_url, join_url, normalize_url};
