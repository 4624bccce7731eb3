//! Shared settings and payload type for the demos.

use serde::{Deserialize, Serialize};
use warren::BrokerConfig;

/// Payload published by `publish` and decoded by `consume`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Tick {
    pub seq: u64,
    pub sent_at_ms: u128,
}

/// Broker settings from `WARREN_HOST`, `WARREN_USER` and `WARREN_PW`.
pub fn broker_config(name: &str) -> BrokerConfig {
    // ---
    let host = std::env::var("WARREN_HOST").unwrap_or_else(|_| "localhost".to_string());
    let user = std::env::var("WARREN_USER").unwrap_or_else(|_| "guest".to_string());
    let pass = std::env::var("WARREN_PW").unwrap_or_else(|_| "guest".to_string());

    BrokerConfig::new(host, 5672, user, pass).with_connection_name(name)
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}
