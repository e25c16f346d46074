//! Connection configuration.
//!
//! [`ConnectionConfig`] holds every tunable of a
//! [`Connection`](crate::Connection). It is usually filled in through
//! [`ConnectionBuilder`](crate::ConnectionBuilder), or loaded from JSON:
//!
//! ```
//! use std::time::Duration;
//! use sphero_wire::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_json(
//!     r#"{ "max_connect_attempts": 3, "retry_delay_ms": 250 }"#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.max_connect_attempts, 3);
//! assert_eq!(config.retry_delay, Duration::from_millis(250));
//! assert!(config.reset_timer);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of connect attempts before giving up.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Default delay between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::ZERO;

/// Default multiplier applied to the delay after each failed attempt.
pub const DEFAULT_RETRY_BACKOFF: f64 = 1.0;

/// Default capacity of the receive loop's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Tunables of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect attempts before [`TransportUnavailable`](crate::SpheroError::TransportUnavailable).
    pub max_connect_attempts: u32,
    /// Sleep between connect attempts.
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub retry_backoff: f64,
    /// Default answer flag for [`Connection::send`](crate::Connection::send).
    pub request_ack: bool,
    /// Default reset-timer flag for [`Connection::send`](crate::Connection::send).
    pub reset_timer: bool,
    /// Read buffer capacity of the receive loop.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Delay to sleep after the given failed attempt (1-based).
    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.retry_backoff.max(0.0).powi(attempt.saturating_sub(1) as i32);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            request_ack: false,
            reset_timer: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpheroError;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_connect_attempts, DEFAULT_MAX_CONNECT_ATTEMPTS);
        assert_eq!(config.retry_delay, Duration::ZERO);
        assert_eq!(config.retry_backoff, 1.0);
        assert!(!config.request_ack);
        assert!(config.reset_timer);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_from_json_empty_object() {
        let config = ConnectionConfig::from_json("{}").unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_from_json_all_fields() {
        let config = ConnectionConfig::from_json(
            r#"{
                "max_connect_attempts": 10,
                "retry_delay_ms": 100,
                "retry_backoff": 2.0,
                "request_ack": true,
                "reset_timer": false,
                "read_buffer_size": 4096
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_connect_attempts, 10);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.retry_backoff, 2.0);
        assert!(config.request_ack);
        assert!(!config.reset_timer);
        assert_eq!(config.read_buffer_size, 4096);
    }

    #[test]
    fn test_from_json_invalid() {
        let result = ConnectionConfig::from_json(r#"{ "max_connect_attempts": "many" }"#);
        assert!(matches!(result, Err(SpheroError::Config(_))));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let config = ConnectionConfig {
            retry_delay: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retry_delay_ms"], 1500);

        let back: ConnectionConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_delay_after_backoff() {
        let config = ConnectionConfig {
            retry_delay: Duration::from_millis(100),
            retry_backoff: 2.0,
            ..Default::default()
        };
        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_after_zero_delay() {
        let config = ConnectionConfig {
            retry_backoff: 3.0,
            ..Default::default()
        };
        assert_eq!(config.delay_after(4), Duration::ZERO);
    }
}
