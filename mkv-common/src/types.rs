//! # Core Type Definitions
//!
//! Address descriptors, key validation and TTL state shared by the client
//! facade and the ephemeral server.
//!
//! ## Design Principles
//!
//! 1. **Validate at the Edge**: Keys and TTLs are checked before any frame is
//!    encoded, so bad input never reaches the network.
//! 2. **Immutable Targets**: A `ConnectionTarget` is built once by a resolver
//!    and only read afterwards.
//! 3. **Distinguishable Absence**: `TtlStatus` keeps "missing" and
//!    "no expiry" apart instead of folding them into sentinel integers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MkvError, MkvResult};

/// URI scheme accepted by the client.
pub const DEFAULT_SCHEME: &str = "redis";

/// Port used when a URI omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Address descriptor used once to establish a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTarget {
    scheme: String,
    host: String,
    port: u16,
}

impl ConnectionTarget {
    /// Builds a `redis://host:port` target.
    pub fn new(host: impl Into<String>, port: u16) -> MkvResult<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(MkvError::invalid_argument("target host must not be empty"));
        }
        Ok(ConnectionTarget {
            scheme: DEFAULT_SCHEME.to_string(),
            host,
            port,
        })
    }

    /// Targets `localhost` on the given port.
    pub fn localhost(port: u16) -> Self {
        ConnectionTarget {
            scheme: DEFAULT_SCHEME.to_string(),
            host: "localhost".to_string(),
            port,
        }
    }

    /// Parses a `redis://host[:port]` URI.
    ///
    /// # Examples
    /// ```rust
    /// use mkv_common::ConnectionTarget;
    ///
    /// let target = ConnectionTarget::parse("redis://localhost:6380").expect("valid uri");
    /// assert_eq!(target.host(), "localhost");
    /// assert_eq!(target.port(), 6380);
    /// ```
    pub fn parse(uri: &str) -> MkvResult<Self> {
        let url = Url::parse(uri)
            .map_err(|err| MkvError::invalid_argument(format!("invalid target uri {uri:?}: {err}")))?;

        if url.scheme() != DEFAULT_SCHEME {
            return Err(MkvError::invalid_argument(format!(
                "unsupported scheme {:?}, expected redis://",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| MkvError::invalid_argument(format!("missing host in {uri:?}")))?;

        Ok(ConnectionTarget {
            scheme: url.scheme().to_string(),
            host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` form accepted by socket connect calls.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.socket_addr())
    }
}

/// TTL state reported by the store, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl TtlStatus {
    /// Maps a `TTL` integer reply onto a status.
    ///
    /// Returns `None` for negative values other than -1/-2.
    pub fn from_reply(value: i64) -> Option<Self> {
        match value {
            -2 => Some(TtlStatus::Missing),
            -1 => Some(TtlStatus::NoExpiry),
            secs if secs >= 0 => Some(TtlStatus::ExpiresIn(Duration::from_secs(secs as u64))),
            _ => None,
        }
    }

    /// Encodes the status back into the `TTL` integer convention.
    pub fn to_reply(self) -> i64 {
        match self {
            TtlStatus::Missing => -2,
            TtlStatus::NoExpiry => -1,
            // Round to the nearest second like Redis does for TTL.
            TtlStatus::ExpiresIn(remaining) => ((remaining.as_millis() + 500) / 1000) as i64,
        }
    }

    /// Remaining whole seconds, if an expiry is set.
    pub fn remaining_secs(self) -> Option<u64> {
        match self {
            TtlStatus::ExpiresIn(remaining) => Some(remaining.as_secs()),
            _ => None,
        }
    }
}

/// Rejects empty key identifiers.
pub fn validate_key(key: &str) -> MkvResult<()> {
    if key.is_empty() {
        return Err(MkvError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

/// Rejects TTLs below one second.
pub fn validate_ttl(ttl_secs: u64) -> MkvResult<()> {
    if ttl_secs < 1 {
        return Err(MkvError::invalid_argument(format!(
            "ttl must be at least 1 second, got {ttl_secs}"
        )));
    }
    Ok(())
}

/// Rejects empty channel names.
pub fn validate_channel(channel: &str) -> MkvResult<()> {
    if channel.is_empty() {
        return Err(MkvError::invalid_argument("channel name must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_with_default_port() {
        let target = ConnectionTarget::parse("redis://localhost").unwrap();
        assert_eq!(target.scheme(), "redis");
        assert_eq!(target.host(), "localhost");
        assert_eq!(target.port(), DEFAULT_PORT);
        assert_eq!(target.to_string(), "redis://localhost:6379");
    }

    #[test]
    fn rejects_foreign_scheme() {
        let err = ConnectionTarget::parse("http://localhost:6379").unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn ipv6_socket_addr_is_bracketed() {
        let target = ConnectionTarget::parse("redis://[::1]:7000").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.socket_addr(), "[::1]:7000");
    }

    #[test]
    fn ttl_reply_mapping() {
        assert_eq!(TtlStatus::from_reply(-2), Some(TtlStatus::Missing));
        assert_eq!(TtlStatus::from_reply(-1), Some(TtlStatus::NoExpiry));
        assert_eq!(
            TtlStatus::from_reply(6),
            Some(TtlStatus::ExpiresIn(Duration::from_secs(6)))
        );
        assert_eq!(TtlStatus::from_reply(-7), None);
        assert_eq!(TtlStatus::ExpiresIn(Duration::from_millis(5_600)).to_reply(), 6);
    }

    #[test]
    fn validation_rules() {
        assert!(validate_key("").is_err());
        assert!(validate_key("k").is_ok());
        assert!(validate_ttl(0).is_err());
        assert!(validate_ttl(1).is_ok());
        assert!(validate_channel("").is_err());
    }

    #[test]
    fn target_serializes() {
        let target = ConnectionTarget::new("127.0.0.1", 6400).unwrap();
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, r#"{"scheme":"redis","host":"127.0.0.1","port":6400}"#);
    }
}
