//! Fetching resource bodies from origin servers.
//!
//! The real fetcher speaks HTTP(S) through reqwest with redirects disabled:
//! redirect responses are archived as-is, and the link extractor later
//! surfaces the target as a synthetic embedded link. Tests substitute their
//! own [`Fetcher`].

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{COOKIE, IF_NONE_MATCH};
use reqwest::redirect::Policy;
use tracing::{info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{CrystalError, Result};
use crate::model::revision::RevisionMetadata;

/// A fetched response: HTTP metadata (when the scheme has any) and the
/// body, fully streamed into a temporary file inside the project's `tmp/`
/// directory and flushed to stable storage.
pub struct FetchedBody {
    pub metadata: Option<RevisionMetadata>,
    pub body: Option<tempfile::NamedTempFile>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one URL. Network and scheme failures are returned as errors;
    /// HTTP error statuses (4xx/5xx) are successful fetches.
    async fn fetch(
        &self,
        url: &str,
        request_cookie: Option<&str>,
        known_etags: &[String],
        tmp_dir: &Path,
    ) -> Result<FetchedBody>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<HttpFetcher> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CrystalError::HttpRequestFailed(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        request_cookie: Option<&str>,
        known_etags: &[String],
        tmp_dir: &Path,
    ) -> Result<FetchedBody> {
        let parsed = Url::parse(url)
            .map_err(|_| CrystalError::NotADownloadableScheme(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CrystalError::NotADownloadableScheme(url.to_string()));
        }

        let mut request = self.client.get(parsed);
        if let Some(cookie) = request_cookie {
            request = request.header(COOKIE, cookie);
        }
        if !known_etags.is_empty() {
            request = request.header(IF_NONE_MATCH, known_etags.join(", "));
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| CrystalError::HttpRequestFailed(e.to_string()))?;
        let metadata = metadata_from_response(&response);

        let mut tmp = tempfile::Builder::new()
            .suffix(".body")
            .tempfile_in(tmp_dir)?;
        let mut bytes = 0usize;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    tmp.write_all(&chunk)?;
                    bytes += chunk.len();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(url, error = %e, "Response body read failed");
                    return Err(CrystalError::HttpRequestFailed(e.to_string()));
                }
            }
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        info!(url, status = metadata.status_code, bytes, "Fetched");
        Ok(FetchedBody {
            metadata: Some(metadata),
            body: Some(tmp),
        })
    }
}

fn metadata_from_response(response: &reqwest::Response) -> RevisionMetadata {
    let status = response.status();
    RevisionMetadata {
        http_version: match response.version() {
            reqwest::Version::HTTP_09 => 9,
            reqwest::Version::HTTP_10 => 10,
            reqwest::Version::HTTP_11 => 11,
            reqwest::Version::HTTP_2 => 20,
            reqwest::Version::HTTP_3 => 30,
            _ => 11,
        },
        status_code: status.as_u16(),
        reason_phrase: status.canonical_reason().unwrap_or("").to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    }
}
