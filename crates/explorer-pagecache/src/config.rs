use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration for the page cache.
///
/// All fields have defaults, so the struct can be embedded into a larger service
/// configuration under `#[serde(default)]`. Durations use the humantime format
/// (`"60s"`, `"2m"`, …).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether stored pages are served and fresh results stored.
    ///
    /// When disabled, every call rebuilds its page. Concurrent builds of the same key
    /// still coalesce onto a single computation.
    pub enabled: bool,

    /// How long a stored page stays valid.
    ///
    /// Callers can override this per call. Once the deadline passes, the entry is
    /// treated as a miss and rebuilt on the next access.
    ///
    /// Defaults to `60s`.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Upper bound on the number of stored entries.
    ///
    /// The maintenance sweep evicts the least recently used entries beyond this cap.
    /// In-flight builds do not count towards it and are never evicted. `None` removes
    /// the cap.
    ///
    /// Defaults to `10_000`.
    pub max_entries: Option<usize>,

    /// How often the maintenance loop removes expired entries and enforces
    /// [`max_entries`](Self::max_entries).
    ///
    /// Defaults to `10s`.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Default bound on how long a caller waits for a page build that is already in
    /// flight.
    ///
    /// `None` waits until the build publishes. The in-flight build is never affected
    /// by a waiter giving up.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            default_ttl: Duration::from_secs(60),
            max_entries: Some(10_000),
            sweep_interval: Duration::from_secs(10),
            wait_timeout: None,
        }
    }
}
