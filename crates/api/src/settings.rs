//! Process configuration from environment variables.

use std::time::Duration;

use flowbridge_core::Network;
use tracing::warn;

/// Everything the binary needs to wire the process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres URL; absent means in-memory stores (dev mode).
    pub database_url: Option<String>,

    pub upstream_base_url: String,
    pub upstream_username: Option<String>,
    pub upstream_password: Option<String>,
    pub upstream_api_key: Option<String>,

    pub payment_base_url: String,
    pub payment_api_key: String,
    pub payment_agent_identifier: String,
    pub payment_amount: u64,
    pub payment_unit: String,
    /// Simulate payments instead of talking to the gateway.
    pub payment_test_mode: bool,

    pub network: Network,

    pub poll_interval: Duration,
    pub max_concurrent_status_checks: usize,
    pub batch_delay: Duration,

    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: var("DATABASE_URL"),
            upstream_base_url: var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3370".to_string()),
            upstream_username: var("UPSTREAM_USERNAME"),
            upstream_password: var("UPSTREAM_PASSWORD"),
            upstream_api_key: var("UPSTREAM_API_KEY"),
            payment_base_url: var("PAYMENT_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3001".to_string()),
            payment_api_key: var("PAYMENT_API_KEY").unwrap_or_default(),
            payment_agent_identifier: var("PAYMENT_AGENT_IDENTIFIER").unwrap_or_default(),
            payment_amount: parse_var("PAYMENT_AMOUNT", 3_000_000),
            payment_unit: var("PAYMENT_UNIT").unwrap_or_else(|| "lovelace".to_string()),
            payment_test_mode: parse_var("PAYMENT_TEST_MODE", false),
            network: Network::parse(&var("NETWORK").unwrap_or_else(|| "preprod".to_string())),
            poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SECONDS", 30)),
            max_concurrent_status_checks: parse_var("MAX_CONCURRENT_STATUS_CHECKS", 5),
            batch_delay: Duration::from_secs(parse_var("BATCH_DELAY_SECONDS", 2)),
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var("PORT", 8000),
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw = %raw, "unparseable value, using default");
            default
        }),
        None => default,
    }
}
