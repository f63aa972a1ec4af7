use std::time::Duration;

/// Max depth of embedded-resource chains. Bounds recursion when a page
/// (incorrectly) embeds an alias of itself.
pub const MAX_EMBEDDED_RECURSION_DEPTH: usize = 3;

/// For small disks, the minimum fraction of total space that must stay free.
const MIN_FREE_FRACTION: f64 = 0.05;
/// For large disks, the minimum free space in bytes.
const MIN_FREE_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Tunables for the download engine.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Pause after downloading a page and its embedded resources, to avoid
    /// overwhelming any particular remote server.
    pub delay_between_downloads: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// How long the scheduler sleeps when no task unit is available.
    pub poll_interval: Duration,
    /// Reuse revisions downloaded earlier in this session instead of
    /// re-fetching. Important for large projects.
    pub assume_fresh_within_session: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            delay_between_downloads: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            user_agent: format!("Crystal/{}", env!("CARGO_PKG_VERSION")),
            poll_interval: Duration::from_millis(100),
            assume_fresh_within_session: true,
        }
    }
}

/// Free bytes required before another download is allowed:
/// max(5% of total space, 4 GiB).
pub fn min_free_bytes(total: u64) -> u64 {
    ((total as f64 * MIN_FREE_FRACTION) as u64).max(MIN_FREE_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_disks_use_the_absolute_floor() {
        // 100 GiB disk: 5% = 5 GiB > 4 GiB
        let total = 100 * 1024 * 1024 * 1024u64;
        assert_eq!(min_free_bytes(total), total / 20);
        // 10 GiB disk: 5% = 0.5 GiB < 4 GiB floor
        let small = 10 * 1024 * 1024 * 1024u64;
        assert_eq!(min_free_bytes(small), MIN_FREE_BYTES);
    }
}
