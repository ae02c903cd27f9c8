// crates/vnns-daemon/src/config.rs
//
// Runtime configuration for the attestation daemon.
// Loaded from a TOML file or populated with sensible defaults.

use serde::Deserialize;
use std::fs;
use std::time::Duration;

use vnns_verify::{RetryConfig, TrackerConfig};

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub tracker: TrackerSection,

    /// Backoff for caller-level resubmission and path fetches.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory for local data storage (RocksDB).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory that receives vkey.json and aggregation exports.
    #[serde(default = "default_export_dir")]
    pub export_dir: String,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    /// "local" (in-process network) or "http" (relay).
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Base URL of the verification relay, used in "http" mode.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default)]
    pub domain_id: u32,

    #[serde(default = "default_circuit_version")]
    pub circuit_version: String,

    /// Base URL for external verification links.
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds a key registration may take to finalize.
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSection {
    #[serde(default = "default_inclusion_timeout_secs")]
    pub inclusion_timeout_secs: u64,

    #[serde(default = "default_aggregation_timeout_secs")]
    pub aggregation_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_data_dir() -> String {
    "~/.vnns/data".to_string()
}

fn default_export_dir() -> String {
    "~/.vnns/export".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> String {
    "local".to_string()
}

fn default_relay_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_circuit_version() -> String {
    "risc0-v2.2".to_string()
}

fn default_explorer_url() -> String {
    "https://zkverify-testnet.subscan.io".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_registration_timeout_secs() -> u64 {
    120
}

fn default_inclusion_timeout_secs() -> u64 {
    300
}

fn default_aggregation_timeout_secs() -> u64 {
    1_800
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            relay_url: default_relay_url(),
            domain_id: 0,
            circuit_version: default_circuit_version(),
            explorer_url: default_explorer_url(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            registration_timeout_secs: default_registration_timeout_secs(),
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            inclusion_timeout_secs: default_inclusion_timeout_secs(),
            aggregation_timeout_secs: default_aggregation_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl TrackerSection {
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            inclusion_timeout: Duration::from_secs(self.inclusion_timeout_secs),
            aggregation_timeout: Duration::from_secs(self.aggregation_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: NetworkSection::default(),
            tracker: TrackerSection::default(),
            retry: RetryConfig::default(),
            data_dir: default_data_dir(),
            export_dir: default_export_dir(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.network.mode, "local");
        assert_eq!(config.network.domain_id, 0);
        assert_eq!(config.network.circuit_version, "risc0-v2.2");
        assert_eq!(config.tracker.aggregation_timeout_secs, 1_800);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/vnns"

            [network]
            mode = "http"
            relay_url = "http://relay:9000"
            domain_id = 3

            [tracker]
            inclusion_timeout_secs = 10

            [retry]
            max_retries = 1
            jitter = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, "/var/lib/vnns");
        assert_eq!(config.network.mode, "http");
        assert_eq!(config.network.domain_id, 3);
        assert_eq!(config.network.circuit_version, "risc0-v2.2");
        assert_eq!(
            config.tracker.tracker_config().inclusion_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.tracker.aggregation_timeout_secs, 1_800);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 500);
    }
}
