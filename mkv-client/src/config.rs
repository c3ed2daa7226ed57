//! Client configuration.

use std::time::Duration;

/// Default bound on the pub/sub acknowledgment wait.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of queued frames coalesced into one socket write.
pub const DEFAULT_MAX_WRITE_BATCH: usize = 64;

/// Configuration shared by a connection and the pub/sub channels it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Optional TCP connect + handshake timeout.
    pub connect_timeout: Option<Duration>,
    /// How long subscribe/unsubscribe wait for the store's acknowledgment.
    pub subscribe_timeout: Duration,
    /// Maximum frames written per flush by the I/O driver.
    pub max_write_batch: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Some(Duration::from_secs(10)),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            max_write_batch: DEFAULT_MAX_WRITE_BATCH,
        }
    }
}

impl ClientConfig {
    /// Reads overrides from `MKV_CONNECT_TIMEOUT_MS`, `MKV_SUBSCRIBE_TIMEOUT_MS`
    /// and `MKV_MAX_WRITE_BATCH`. Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("MKV_CONNECT_TIMEOUT_MS").ok().as_deref(),
            std::env::var("MKV_SUBSCRIBE_TIMEOUT_MS").ok().as_deref(),
            std::env::var("MKV_MAX_WRITE_BATCH").ok().as_deref(),
        )
    }

    fn from_vars(
        connect_timeout_ms: Option<&str>,
        subscribe_timeout_ms: Option<&str>,
        max_write_batch: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        ClientConfig {
            // 0 disables the connect timeout.
            connect_timeout: match connect_timeout_ms.and_then(|s| s.parse::<u64>().ok()) {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.connect_timeout,
            },
            subscribe_timeout: subscribe_timeout_ms
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.subscribe_timeout),
            max_write_batch: max_write_batch
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_write_batch),
        }
    }
}
