//! Connection configuration.
//!
//! This type intentionally contains no protocol-client specifics. Connectors
//! are responsible for interpreting it into concrete connection settings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, WarrenError};

/// Capped exponential backoff used between reconnect attempts.
///
/// Reconnects never give up on their own; only the delay between attempts is
/// tunable.
///
/// # Example
///
/// ```
/// use warren::BackoffConfig;
/// use std::time::Duration;
///
/// let backoff = BackoffConfig {
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Backoff multiplier applied to the delay after each failed attempt.
    pub multiplier: f32,

    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Broker endpoint, credentials and session tuning.
#[derive(Clone)]
pub struct BrokerConfig {
    // ---
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,

    /// Virtual host, `/` unless set.
    pub vhost: String,

    /// Name reported to the broker, used for logging on both ends.
    pub connection_name: String,

    /// Bound on the initial connect; exceeding it fails construction.
    ///
    /// Reconnect attempts use the same bound per attempt.
    pub connect_timeout: Duration,

    /// Protocol heartbeat in seconds; `None` keeps the client default.
    pub heartbeat_secs: Option<u16>,

    /// Poll interval of the supervisor's health check; `None` disables it
    /// and leaves failure detection to Writers and Readers.
    pub health_check_interval: Option<Duration>,

    /// Reconnect backoff.
    pub backoff: BackoffConfig,

    /// Capacity of a Writer's send port. `send` blocks when it is full.
    pub send_capacity: usize,

    /// Capacity of the buffer between the broker consumer and a Reader's sink.
    pub delivery_capacity: usize,
}

impl BrokerConfig {
    /// Create a config for `host:port` with the given credentials.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            vhost: "/".to_string(),
            connection_name: "warren".to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_secs: None,
            health_check_interval: Some(Duration::from_secs(1)),
            backoff: BackoffConfig::default(),
            send_capacity: 1024,
            delivery_capacity: 1024,
        }
    }

    /// Config for the in-memory broker; host and credentials are unused.
    pub fn memory() -> Self {
        Self::new("memory", 0, "guest", "guest")
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_secs(mut self, secs: u16) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_send_capacity(mut self, capacity: usize) -> Self {
        self.send_capacity = capacity;
        self
    }

    pub fn with_delivery_capacity(mut self, capacity: usize) -> Self {
        self.delivery_capacity = capacity;
        self
    }

    /// `host:port`, for logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.send_capacity == 0 {
            return Err(WarrenError::InvalidConfig(
                "send_capacity must be greater than zero".into(),
            ));
        }
        if self.delivery_capacity == 0 {
            return Err(WarrenError::InvalidConfig(
                "delivery_capacity must be greater than zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(WarrenError::InvalidConfig(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(WarrenError::InvalidConfig(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(WarrenError::InvalidConfig(
                "backoff initial_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("connection_name", &self.connection_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("health_check_interval", &self.health_check_interval)
            .field("backoff", &self.backoff)
            .field("send_capacity", &self.send_capacity)
            .field("delivery_capacity", &self.delivery_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        // ---
        let config = BrokerConfig::new("localhost", 5672, "guest", "s3cret");
        let text = format!("{config:?}");
        assert!(!text.contains("s3cret"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_unbounded_ports() {
        // ---
        let config = BrokerConfig::memory().with_send_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(WarrenError::InvalidConfig(_))
        ));

        let config = BrokerConfig::memory().with_delivery_capacity(0);
        assert!(config.validate().is_err());

        assert!(BrokerConfig::memory().validate().is_ok());
    }

    #[test]
    fn test_validate_backoff() {
        // ---
        let config = BrokerConfig::memory().with_backoff(BackoffConfig {
            multiplier: 0.5,
            ..BackoffConfig::default()
        });
        assert!(config.validate().is_err());

        let config = BrokerConfig::memory().with_backoff(BackoffConfig {
            multiplier: 2.0,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_from_json() {
        // ---
        let backoff: BackoffConfig = serde_json::from_str(
            r#"{"multiplier": 3.0, "max_delay": {"secs": 30, "nanos": 0}}"#,
        )
        .unwrap();
        assert_eq!(backoff.multiplier, 3.0);
        assert_eq!(backoff.initial_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
    }
}
