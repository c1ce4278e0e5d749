//! Worker configuration.
//!
//! Loaded from `config.toml` in the data directory when present, with
//! defaults for everything; environment variables override the file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pulse_store::paths::DataDir;

/// Opt the worker into an in-memory identity.
pub const EPHEMERAL_ENV: &str = "AGENT_PULSE_EPHEMERAL";

/// Optional webhook sink for delivered messages.
pub const WEBHOOK_ENV: &str = "AGENT_PULSE_WEBHOOK_URL";

/// Complete worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Relay URLs the pool holds sessions against.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// Topic carrying announcements and direct traffic.
    #[serde(default = "default_primary_topic")]
    pub primary_topic: String,

    /// Self-reported name attached to announce payloads.
    #[serde(default)]
    pub agent_name: String,

    /// Use a fresh in-memory identity; never read or write identity.json.
    #[serde(default)]
    pub ephemeral: bool,

    /// POST delivered messages here, best effort.
    #[serde(default)]
    pub webhook_url: String,

    /// Command-file poll interval in ms.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retry-queue sweep interval in ms.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Health heartbeat interval in ms.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Queue-TTL and limiter-eviction sweep interval in ms.
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: u64,
}

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.nostr.band".to_string(),
        "wss://nostr.wine".to_string(),
        "wss://relay.snort.social".to_string(),
    ]
}

fn default_primary_topic() -> String {
    "agent-pulse".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_health_interval_ms() -> u64 {
    5000
}

fn default_expiry_interval_ms() -> u64 {
    60_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            primary_topic: default_primary_topic(),
            agent_name: String::new(),
            ephemeral: false,
            webhook_url: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            expiry_interval_ms: default_expiry_interval_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load from the data directory's `config.toml`, then apply
    /// environment overrides.
    pub fn load(data: &DataDir) -> anyhow::Result<Self> {
        let path = data.config_file();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables override the file.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(EPHEMERAL_ENV) {
            self.ephemeral = value == "true" || value == "1";
        }
        if let Ok(url) = std::env::var(WEBHOOK_ENV) {
            self.webhook_url = url;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }

    /// The webhook URL, when configured.
    pub fn webhook(&self) -> Option<&str> {
        if self.webhook_url.is_empty() {
            None
        } else {
            Some(&self.webhook_url)
        }
    }
}
